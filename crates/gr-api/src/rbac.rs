use gr_core::types::Role;

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReviewsRead,
    ReviewsActOn,
    ProtocolManage,
    QuarantineRead,
    QuarantineManage,
    RateLimitAdmin,
    HealthRead,
}

/// What each role may do. Admin is a superset by construction.
pub fn role_has(role: Role, permission: Permission) -> bool {
    use Permission::*;
    match role {
        Role::Admin => true,
        Role::Reviewer => matches!(
            permission,
            ReviewsRead | ReviewsActOn | QuarantineRead | QuarantineManage | HealthRead
        ),
        Role::Viewer => matches!(permission, ReviewsRead | QuarantineRead | HealthRead),
    }
}

// ---------------------------------------------------------------------------
// Route table
// ---------------------------------------------------------------------------

/// `(method, path-with-wildcards) → permission`. A `*` matches exactly one
/// path segment. Routes not in the table only require authentication.
const ROUTE_TABLE: &[(&str, &str, Permission)] = &[
    ("GET", "/reviews/pending", Permission::ReviewsRead),
    ("GET", "/reviews/*", Permission::ReviewsRead),
    ("POST", "/reviews/*/claim", Permission::ReviewsActOn),
    ("POST", "/reviews/*/approve", Permission::ReviewsActOn),
    ("POST", "/reviews/*/reject", Permission::ReviewsActOn),
    ("POST", "/users/*/protocol", Permission::ProtocolManage),
    ("GET", "/quarantine/messages", Permission::QuarantineRead),
    ("GET", "/quarantine/stats", Permission::QuarantineRead),
    ("GET", "/quarantine/audit-log", Permission::QuarantineRead),
    ("POST", "/quarantine/*/process", Permission::QuarantineManage),
    ("POST", "/quarantine/batch-process", Permission::QuarantineManage),
    ("POST", "/quarantine/cleanup", Permission::QuarantineManage),
    ("DELETE", "/quarantine/*", Permission::QuarantineManage),
    ("GET", "/api/rate-limits/stats", Permission::RateLimitAdmin),
    ("GET", "/api/rate-limits/violations", Permission::RateLimitAdmin),
    ("GET", "/api/rate-limits/alerts", Permission::RateLimitAdmin),
    ("GET", "/api/rate-limits/config", Permission::RateLimitAdmin),
    ("GET", "/api/rate-limits/client/*", Permission::RateLimitAdmin),
    (
        "DELETE",
        "/api/rate-limits/client/*/violations",
        Permission::RateLimitAdmin,
    ),
    ("GET", "/mcp/health", Permission::HealthRead),
    ("GET", "/mcp/metrics", Permission::HealthRead),
    ("POST", "/internal/messages", Permission::ProtocolManage),
];

/// The permission required for a request, if any.
pub fn required_permission(method: &str, path: &str) -> Option<Permission> {
    ROUTE_TABLE
        .iter()
        .find(|(m, pattern, _)| *m == method && path_matches(pattern, path))
        .map(|(_, _, p)| *p)
}

fn path_matches(pattern: &str, path: &str) -> bool {
    let mut pattern_segments = pattern.split('/').filter(|s| !s.is_empty());
    let mut path_segments = path.split('/').filter(|s| !s.is_empty());

    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) if p == "*" || p == s => continue,
            _ => return false,
        }
    }
}

/// Whether `role` may perform (method, path).
pub fn allowed(role: Role, method: &str, path: &str) -> bool {
    match required_permission(method, path) {
        Some(permission) => role_has(role, permission),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_wildcards_match_one_segment() {
        assert!(path_matches("/reviews/*", "/reviews/42"));
        assert!(!path_matches("/reviews/*", "/reviews/42/approve"));
        assert!(path_matches("/reviews/*/approve", "/reviews/42/approve"));
        assert!(path_matches(
            "/api/rate-limits/client/*/violations",
            "/api/rate-limits/client/ip:1.2.3.4/violations"
        ));
    }

    #[test]
    fn reviewer_can_review_but_not_manage_protocol() {
        assert!(allowed(Role::Reviewer, "GET", "/reviews/pending"));
        assert!(allowed(Role::Reviewer, "POST", "/reviews/42/approve"));
        assert!(allowed(Role::Reviewer, "POST", "/quarantine/42/process"));
        assert!(!allowed(Role::Reviewer, "POST", "/users/u9/protocol"));
        assert!(!allowed(Role::Reviewer, "GET", "/api/rate-limits/stats"));
    }

    #[test]
    fn viewer_is_read_only() {
        assert!(allowed(Role::Viewer, "GET", "/reviews/pending"));
        assert!(allowed(Role::Viewer, "GET", "/quarantine/stats"));
        assert!(!allowed(Role::Viewer, "POST", "/reviews/42/approve"));
        assert!(!allowed(Role::Viewer, "POST", "/quarantine/batch-process"));
        assert!(!allowed(Role::Viewer, "DELETE", "/quarantine/42"));
    }

    #[test]
    fn admin_can_do_everything() {
        for (method, path) in [
            ("POST", "/users/u1/protocol"),
            ("DELETE", "/quarantine/42"),
            ("GET", "/api/rate-limits/stats"),
            ("DELETE", "/api/rate-limits/client/ip:1.1.1.1/violations"),
        ] {
            assert!(allowed(Role::Admin, method, path), "{method} {path}");
        }
    }

    #[test]
    fn unlisted_routes_need_only_authentication() {
        assert_eq!(required_permission("GET", "/auth/me"), None);
        assert!(allowed(Role::Viewer, "GET", "/auth/me"));
    }
}
