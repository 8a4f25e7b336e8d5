use scriptctl_core::SecretRedactor;
use scriptctl_core::redact::{self, MASK};
use std::collections::HashMap;

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_detects_by_variable_name() {
    let vars = env(&[
        ("API_KEY", "abcd1234"),
        ("DB_PASSWORD", "hunter22"),
        ("GITHUB_TOKEN", "ghp_xyz"),
        ("PATH", "/usr/bin"),
        ("SHORT_SECRET", "abc"),
    ]);

    let found = redact::detect(&vars);
    assert_eq!(found, vec!["abcd1234", "ghp_xyz", "hunter22"]);
}

#[test]
fn test_masks_plain_and_encoded_forms() {
    let vars = env(&[("CLIENT_SECRET", "p@ss w0rd/1")]);
    let redactor = SecretRedactor::from_env(&vars);

    let line = "login p@ss w0rd/1 then https://x?s=p%40ss%20w0rd%2F1&lower=p%40ss%20w0rd%2f1";
    let masked = redactor.mask(line);
    assert!(!masked.contains("p@ss w0rd/1"));
    assert!(!masked.contains("p%40ss%20w0rd%2F1"));
    assert!(!masked.contains("p%40ss%20w0rd%2f1"));
    assert_eq!(masked.matches(MASK).count(), 3);
}

#[test]
fn test_text_without_secrets_is_untouched() {
    let redactor = SecretRedactor::new(vec!["s3cr3t-value".to_string()]);
    let line = "server listening on 0.0.0.0:8080";
    assert!(matches!(
        redactor.mask(line),
        std::borrow::Cow::Borrowed(_)
    ));
}

#[test]
fn test_secret_never_leaks_in_any_context() {
    let secret = "tok-9f8e7d6c";
    let redactor = SecretRedactor::new(vec![secret.to_string()]);
    let contexts = [
        "", " ", "prefix", "{\"k\":\"", "\n", "tok-", "-", "==", "tok-9f8e",
    ];
    for before in contexts {
        for after in contexts {
            let line = format!("{before}{secret}{after}");
            let masked = redactor.mask(&line);
            assert!(!masked.contains(secret), "leaked in {line:?}");
        }
    }
}

#[test]
fn test_one_shot_mask() {
    let masked = redact::mask("a=longvalue b=longvalue", &["longvalue".to_string()]);
    assert_eq!(masked, "a=**** b=****");
}
