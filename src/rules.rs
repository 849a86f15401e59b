// Copyright 2018 the hostfw developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Formatting helpers for individual `iptables-restore` rule fragments.

/// Prefix carried by every chain this system owns. Chains without the
/// prefix are invisible to the updater: they are never rewritten, never
/// deleted and never counted during cleanup.
pub const OWNED_CHAIN_PREFIX: &'static str = "hostfw-";

// iptables rejects comments longer than 256 bytes.
const MAX_COMMENT_LEN: usize = 255;

/// Fragment that empties the given chain.
pub fn flush_fragment(chain: &str) -> String {
    format!("--flush {}", chain)
}

/// Fragment appending a DROP rule tagged with a human-readable comment.
pub fn commented_drop_fragment(chain: &str, comment: &str) -> String {
    let comment: String = comment.chars().take(MAX_COMMENT_LEN).collect();
    format!(
        "--append {} --jump DROP -m comment --comment \"{}\"",
        chain, comment
    )
}

/// Body that replaces a chain with a safe placeholder: flush it, then
/// drop all traffic, with a comment marking the chain as missing.
pub fn stub_fragments(chain: &str) -> Vec<String> {
    vec![
        flush_fragment(chain),
        commented_drop_fragment(chain, "WARNING Missing chain DROP:"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_body_flushes_then_drops() {
        assert_eq!(
            stub_fragments("hostfw-x"),
            vec![
                "--flush hostfw-x".to_owned(),
                "--append hostfw-x --jump DROP -m comment \
                 --comment \"WARNING Missing chain DROP:\""
                    .to_owned(),
            ]
        );
    }

    #[test]
    fn over_long_comments_are_truncated() {
        let long = "x".repeat(400);
        let fragment = commented_drop_fragment("hostfw-x", &long);
        assert!(fragment.contains(&"x".repeat(255)));
        assert!(!fragment.contains(&"x".repeat(256)));
    }
}
