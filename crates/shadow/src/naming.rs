//! DNS-label naming for shadow ids, namespaces, sandboxes and test jobs.

/// Maximum length of a Kubernetes DNS-1123 label.
pub const MAX_LABEL_LEN: usize = 63;

/// Substitute used when sanitizing leaves nothing behind.
pub const DEFAULT_TOKEN: &str = "shadow";

/// Turn arbitrary input into a valid DNS-1123 label.
///
/// Lowercases ASCII, maps every other character to `-`, collapses runs of
/// `-`, trims leading/trailing `-` and truncates to 63 characters. The
/// result is never empty and `sanitize(sanitize(x)) == sanitize(x)`.
#[must_use]
pub fn sanitize(input: &str) -> String {
    let mut out = label_chars(input);
    out.truncate(MAX_LABEL_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str(DEFAULT_TOKEN);
    }
    out
}

/// Lowercase ASCII alphanumerics, everything else as single `-`, no leading `-`.
fn label_chars(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LABEL_LEN));
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if mapped == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(mapped);
    }
    out
}

/// Host namespace for a shadow: `prefix` followed by the sanitized id.
///
/// The id is truncated, never the prefix, so the name stays within 63
/// characters and still carries the configured prefix.
#[must_use]
pub fn host_namespace_for(prefix: &str, id: &str) -> String {
    let prefix = clamp_prefix(prefix);
    let budget = MAX_LABEL_LEN.saturating_sub(prefix.len());
    let mut tail = sanitize(id);
    tail.truncate(budget);
    while tail.ends_with('-') {
        tail.pop();
    }
    if prefix.is_empty() {
        return sanitize(&tail);
    }
    if tail.is_empty() {
        tail = DEFAULT_TOKEN[..DEFAULT_TOKEN.len().min(budget)].to_string();
    }
    sanitize(&format!("{prefix}{tail}"))
}

/// Name of the virtual control plane release inside the host namespace.
#[must_use]
pub fn sandbox_name(id: &str) -> String {
    // vcluster derives several object names from the release name; keep it short.
    let mut name = sanitize(&format!("vc-{id}"));
    name.truncate(40);
    sanitize(&name)
}

/// Fresh shadow id, e.g. `shadow-3f9a1c2e`.
#[must_use]
pub fn generate_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{DEFAULT_TOKEN}-{}", &uuid[..8])
}

/// Unique name for a verification job, `<kind>-<id>-<suffix>`.
#[must_use]
pub fn job_name(kind: &str, id: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    let suffix = &uuid[..5];
    let mut base = sanitize(&format!("{kind}-{id}"));
    base.truncate(MAX_LABEL_LEN - suffix.len() - 1);
    while base.ends_with('-') {
        base.pop();
    }
    format!("{base}-{suffix}")
}

/// `true` when `name` is already a valid DNS-1123 label.
#[must_use]
pub fn is_valid_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_LABEL_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// The prefix reduced to label characters, keeping its trailing `-`, with
/// room left for at least a few characters of the id.
fn clamp_prefix(prefix: &str) -> String {
    let mut prefix = label_chars(prefix);
    prefix.truncate(MAX_LABEL_LEN - 8);
    prefix
}

#[cfg(test)]
mod tests {
    use {super::*, proptest::prelude::*, rstest::rstest};

    #[rstest]
    #[case("Checkout-API", "checkout-api")]
    #[case("payments_v2.svc", "payments-v2-svc")]
    #[case("--edge--", "edge")]
    #[case("a__b", "a-b")]
    #[case("", "shadow")]
    #[case("!!!", "shadow")]
    #[case("Ünïcode", "n-code")]
    fn sanitizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize(input), expected);
    }

    #[test]
    fn truncates_to_label_length() {
        let long = "x".repeat(200);
        assert_eq!(sanitize(&long).len(), MAX_LABEL_LEN);
    }

    #[test]
    fn host_namespace_keeps_prefix_when_truncating() {
        let id = "a".repeat(100);
        let ns = host_namespace_for("shadow-", &id);
        assert!(ns.starts_with("shadow-"));
        assert_eq!(ns.len(), MAX_LABEL_LEN);
        assert!(is_valid_label(&ns));
    }

    #[test]
    fn host_namespace_for_plain_id() {
        assert_eq!(host_namespace_for("shadow-", "Fix-42"), "shadow-fix-42");
    }

    #[rstest]
    #[case("Shadow_", "shadow-fix-1")]
    #[case("ÉTÉ-", "t-fix-1")]
    #[case("", "fix-1")]
    fn host_namespace_normalizes_prefix(#[case] prefix: &str, #[case] expected: &str) {
        assert_eq!(host_namespace_for(prefix, "fix-1"), expected);
    }

    #[test]
    fn multibyte_prefix_does_not_overflow() {
        let ns = host_namespace_for(&"é".repeat(40), "fix-1");
        assert!(is_valid_label(&ns));
        assert_eq!(ns, "fix-1");

        let ns = host_namespace_for(&format!("{}é", "p".repeat(54)), "fix-1");
        assert!(is_valid_label(&ns));
        assert!(ns.starts_with(&"p".repeat(54)));
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert!(is_valid_label(&a));
        assert!(a.starts_with("shadow-"));
    }

    #[test]
    fn job_names_fit_in_a_label() {
        let name = job_name("smoke", &"y".repeat(80));
        assert!(name.len() <= MAX_LABEL_LEN);
        assert!(is_valid_label(&name));
        assert!(name.starts_with("smoke-"));
    }

    #[test]
    fn sandbox_name_is_short() {
        let name = sandbox_name(&"z".repeat(80));
        assert!(name.len() <= 40);
        assert!(name.starts_with("vc-"));
    }

    proptest! {
        #[test]
        fn sanitize_is_idempotent_and_valid(input in ".{0,120}") {
            let once = sanitize(&input);
            prop_assert!(is_valid_label(&once));
            prop_assert_eq!(sanitize(&once), once);
        }

        #[test]
        fn host_namespace_always_valid(prefix in ".{0,80}", id in ".{0,100}") {
            let ns = host_namespace_for(&prefix, &id);
            prop_assert!(is_valid_label(&ns));
        }
    }
}
