use gr_core::types::{Interaction, ReviewStatus};
use gr_core::{Error, Result};

/// What a validated transition request should do to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Perform the state change.
    Apply,
    /// Already in the target state for this caller: succeed without writing.
    NoOp,
}

/// Reviewer input for an approval.
#[derive(Debug, Clone)]
pub struct ApproveRequest {
    pub final_bubbles: Vec<String>,
    pub edit_tags: Vec<String>,
    pub quality_score: Option<i16>,
    pub reviewer_notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Transition validation
// ---------------------------------------------------------------------------
//
// Both backends load the row (under a lock for the relational one), run
// these checks, and only then write. Retries of the same (operation, id,
// reviewer) tuple land in the NoOp arm.

pub fn validate_claim(interaction: &Interaction, reviewer_id: &str) -> Result<Outcome> {
    match interaction.review_status {
        ReviewStatus::Pending => Ok(Outcome::Apply),
        ReviewStatus::InReview if interaction.reviewer_id.as_deref() == Some(reviewer_id) => {
            Ok(Outcome::NoOp)
        }
        status => Err(Error::Conflict(format!(
            "cannot claim interaction {} in state {}",
            interaction.id,
            status.as_str()
        ))),
    }
}

pub fn validate_approve(
    interaction: &Interaction,
    reviewer_id: &str,
    request: &ApproveRequest,
) -> Result<Outcome> {
    if request.final_bubbles.is_empty() {
        return Err(Error::Validation("final_bubbles must not be empty".into()));
    }
    if let Some(score) = request.quality_score {
        if !(1..=5).contains(&score) {
            return Err(Error::Validation(format!(
                "quality_score {score} outside 1..=5"
            )));
        }
    }

    match interaction.review_status {
        ReviewStatus::InReview if interaction.reviewer_id.as_deref() == Some(reviewer_id) => {
            Ok(Outcome::Apply)
        }
        ReviewStatus::Approved if interaction.reviewer_id.as_deref() == Some(reviewer_id) => {
            Ok(Outcome::NoOp)
        }
        ReviewStatus::InReview => Err(Error::Conflict(format!(
            "interaction {} is claimed by another reviewer",
            interaction.id
        ))),
        status => Err(Error::Conflict(format!(
            "cannot approve interaction {} in state {}",
            interaction.id,
            status.as_str()
        ))),
    }
}

pub fn validate_reject(interaction: &Interaction, reviewer_id: &str) -> Result<Outcome> {
    match interaction.review_status {
        ReviewStatus::InReview if interaction.reviewer_id.as_deref() == Some(reviewer_id) => {
            Ok(Outcome::Apply)
        }
        ReviewStatus::Rejected if interaction.reviewer_id.as_deref() == Some(reviewer_id) => {
            Ok(Outcome::NoOp)
        }
        ReviewStatus::InReview => Err(Error::Conflict(format!(
            "interaction {} is claimed by another reviewer",
            interaction.id
        ))),
        status => Err(Error::Conflict(format!(
            "cannot reject interaction {} in state {}",
            interaction.id,
            status.as_str()
        ))),
    }
}

pub fn validate_deliver(interaction: &Interaction) -> Result<Outcome> {
    if interaction.delivery_hold {
        return Err(Error::Conflict(format!(
            "interaction {} is held for non-delivery",
            interaction.id
        )));
    }
    match interaction.review_status {
        ReviewStatus::Approved => Ok(Outcome::Apply),
        ReviewStatus::Delivered => Ok(Outcome::NoOp),
        status => Err(Error::Conflict(format!(
            "cannot deliver interaction {} in state {}",
            interaction.id,
            status.as_str()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
