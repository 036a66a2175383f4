use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

pub const CONTAINER_NAME_PATTERN: &str = r"^[a-zA-Z0-9][a-zA-Z0-9_.-]+$";

const MAX_CONTAINER_NAME: usize = 50;
const MAX_DESC: usize = 300;
const MAX_NODE_NAME: usize = 50;
const MAX_NODE_COMMENT: usize = 200;

fn container_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CONTAINER_NAME_PATTERN).expect("static pattern"))
}

pub fn is_valid_container_name(name: &str) -> bool {
    name.chars().count() <= MAX_CONTAINER_NAME && container_name_regex().is_match(name)
}

pub fn is_valid_desc(desc: &str) -> bool {
    desc.chars().count() <= MAX_DESC
}

pub fn is_valid_node_name(name: &str) -> bool {
    let n = name.chars().count();
    (1..=MAX_NODE_NAME).contains(&n)
}

pub fn is_valid_node_comment(comment: &str) -> bool {
    comment.chars().count() <= MAX_NODE_COMMENT
}

pub fn is_valid_node_addr(addr: &str) -> bool {
    addr.parse::<Ipv4Addr>().is_ok()
}

/// Order-preserving dedup.
pub fn unique_strings(items: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .iter()
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names() {
        assert!(is_valid_container_name("web-1"));
        assert!(is_valid_container_name("a.b_c"));
        assert!(!is_valid_container_name("-web"));
        assert!(!is_valid_container_name("x"));
        assert!(!is_valid_container_name("has space"));
        assert!(!is_valid_container_name(&"a".repeat(51)));
    }

    #[test]
    fn node_fields() {
        assert!(is_valid_node_addr("10.0.0.5"));
        assert!(!is_valid_node_addr("10.0.0"));
        assert!(!is_valid_node_addr("node.local"));
        assert!(!is_valid_node_name(""));
        assert!(is_valid_node_name("节点一"));
        assert!(!is_valid_node_comment(&"c".repeat(201)));
    }

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let ids = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(unique_strings(&ids), vec!["b".to_string(), "a".to_string()]);
    }
}
