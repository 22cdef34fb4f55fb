//! Decoder for the parenthesised output of `xm list -l`.
//!
//! The format is a sequence of nested lists:
//!
//! ```text
//! (domain
//!     (domid 3)
//!     (name win7)
//!     (status 2)
//! )
//! ```
//!
//! This module only rebuilds the tree. What `status` or `name` mean is
//! decided by [`StateResolver`](crate::StateResolver).

use std::fmt;

use crate::error::{HypervisorError, Result};

/// A child of a [`ParsedRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Bare or double-quoted atom (quotes removed).
    Atom(String),
    /// Nested list.
    List(ParsedRecord),
}

/// One parenthesised list. The first atom is the tag; the rest are children.
///
/// A list that is empty or starts with a nested list has an empty tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedRecord {
    pub tag: String,
    pub children: Vec<Node>,
}

impl ParsedRecord {
    /// Create an empty record with the given tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            children: Vec::new(),
        }
    }

    /// Append an atom child.
    pub fn with_atom(mut self, atom: impl Into<String>) -> Self {
        self.children.push(Node::Atom(atom.into()));
        self
    }

    /// Append a nested record.
    pub fn with_record(mut self, record: ParsedRecord) -> Self {
        self.children.push(Node::List(record));
        self
    }

    /// Append `(tag value)`.
    pub fn with_field(self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_record(ParsedRecord::new(tag).with_atom(value))
    }

    /// Immediate child records.
    pub fn records(&self) -> impl Iterator<Item = &ParsedRecord> {
        self.children.iter().filter_map(|c| match c {
            Node::List(r) => Some(r),
            Node::Atom(_) => None,
        })
    }

    /// First immediate child record with the given tag.
    pub fn find(&self, tag: &str) -> Option<&ParsedRecord> {
        self.records().find(|r| r.tag == tag)
    }

    /// First atom among the immediate children.
    pub fn value(&self) -> Option<&str> {
        self.children.iter().find_map(|c| match c {
            Node::Atom(a) => Some(a.as_str()),
            Node::List(_) => None,
        })
    }

    /// Value of the immediate `(tag value)` child.
    pub fn field(&self, tag: &str) -> Option<&str> {
        self.find(tag).and_then(ParsedRecord::value)
    }
}

impl fmt::Display for ParsedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        if !self.tag.is_empty() {
            write_atom(f, &self.tag)?;
            first = false;
        }
        for child in &self.children {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            match child {
                Node::Atom(a) => write_atom(f, a)?,
                Node::List(r) => write!(f, "{}", r)?,
            }
        }
        write!(f, ")")
    }
}

fn write_atom(f: &mut fmt::Formatter<'_>, atom: &str) -> fmt::Result {
    let needs_quotes = atom.is_empty()
        || atom
            .chars()
            .any(|c| c.is_whitespace() || c == '(' || c == ')' || c == '"');
    if needs_quotes {
        write!(f, "\"")?;
        for c in atom.chars() {
            if c == '"' || c == '\\' {
                write!(f, "\\")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, "\"")
    } else {
        write!(f, "{}", atom)
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Open,
    Close,
    Atom(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut atom = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => atom.push(escaped),
                            None => {
                                return Err(HypervisorError::UnparseableOutput(
                                    "unterminated escape in quoted atom".to_string(),
                                ))
                            }
                        },
                        Some(other) => atom.push(other),
                        None => {
                            return Err(HypervisorError::UnparseableOutput(
                                "unterminated quoted atom".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Atom(atom));
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }

    Ok(tokens)
}

fn into_record(items: Vec<Node>) -> ParsedRecord {
    let mut items = items.into_iter().peekable();
    let tag = match items.next_if(|n| matches!(n, Node::Atom(_))) {
        Some(Node::Atom(tag)) => tag,
        _ => String::new(),
    };
    ParsedRecord {
        tag,
        children: items.collect(),
    }
}

/// Parse one or more top-level expressions.
///
/// Fails with [`HypervisorError::UnparseableOutput`] on unbalanced
/// parentheses, atoms outside any list, or input with no expression.
pub fn parse(raw: &[u8]) -> Result<Vec<ParsedRecord>> {
    let text = String::from_utf8_lossy(raw);
    let tokens = tokenize(&text)?;

    let mut top_level = Vec::new();
    let mut stack: Vec<Vec<Node>> = Vec::new();

    for token in tokens {
        match token {
            Token::Open => stack.push(Vec::new()),
            Token::Atom(atom) => match stack.last_mut() {
                Some(items) => items.push(Node::Atom(atom)),
                None => {
                    return Err(HypervisorError::UnparseableOutput(format!(
                        "atom '{}' outside of any expression",
                        atom
                    )))
                }
            },
            Token::Close => {
                let items = stack.pop().ok_or_else(|| {
                    HypervisorError::UnparseableOutput("unbalanced ')'".to_string())
                })?;
                let record = into_record(items);
                match stack.last_mut() {
                    Some(parent) => parent.push(Node::List(record)),
                    None => top_level.push(record),
                }
            }
        }
    }

    if !stack.is_empty() {
        return Err(HypervisorError::UnparseableOutput(format!(
            "{} unclosed '('",
            stack.len()
        )));
    }
    if top_level.is_empty() {
        return Err(HypervisorError::UnparseableOutput(
            "no expression in output".to_string(),
        ));
    }

    Ok(top_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_domain() {
        let records = parse(b"(domain (name win7) (status 2))").unwrap();
        assert_eq!(records.len(), 1);

        let domain = &records[0];
        assert_eq!(domain.tag, "domain");
        assert_eq!(domain.field("name"), Some("win7"));
        assert_eq!(domain.field("status"), Some("2"));
        assert_eq!(domain.field("missing"), None);
    }

    #[test]
    fn test_multiple_top_level() {
        let output = b"(domain (domid 0) (name Domain-0) (status 2))\n\
                       (domain (domid 7) (name winxp) (status 0))\n";
        let records = parse(output).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].field("name"), Some("winxp"));
    }

    #[test]
    fn test_nested_structure_preserved() {
        let output = b"(domain (name a) (device (vif (mac 00:16:3e:00:00:01) (bridge xenbr0))))";
        let records = parse(output).unwrap();
        let expected = ParsedRecord::new("domain")
            .with_field("name", "a")
            .with_record(
                ParsedRecord::new("device").with_record(
                    ParsedRecord::new("vif")
                        .with_field("mac", "00:16:3e:00:00:01")
                        .with_field("bridge", "xenbr0"),
                ),
            );
        assert_eq!(records, vec![expected]);
    }

    #[test]
    fn test_multiline_xm_output() {
        let output = b"(domain\n    (domid 12)\n    (on_crash restart)\n    (uuid 4a2f-77)\n    (name win7)\n    (status 2)\n)\n";
        let records = parse(output).unwrap();
        assert_eq!(records[0].field("domid"), Some("12"));
        assert_eq!(records[0].field("status"), Some("2"));
    }

    #[test]
    fn test_quoted_atoms() {
        let records = parse(br#"(domain (name "my vm") (cmdline "root=/dev/xvda \"ro\""))"#).unwrap();
        assert_eq!(records[0].field("name"), Some("my vm"));
        assert_eq!(records[0].field("cmdline"), Some("root=/dev/xvda \"ro\""));
    }

    #[test]
    fn test_empty_and_untagged_lists() {
        let records = parse(b"(() ((a 1)))").unwrap();
        let outer = &records[0];
        assert_eq!(outer.tag, "");
        assert_eq!(outer.children.len(), 2);
        match &outer.children[0] {
            Node::List(r) => assert_eq!(r, &ParsedRecord::default()),
            other => panic!("unexpected child {:?}", other),
        }
    }

    #[test]
    fn test_display_reparses_to_same_tree() {
        let input = br#"(domain (name "a b") (image (linux (kernel /boot/vmlinuz))) (status 2))"#;
        let records = parse(input).unwrap();
        let rendered = records[0].to_string();
        assert_eq!(parse(rendered.as_bytes()).unwrap(), records);
    }

    #[test]
    fn test_unbalanced_parentheses() {
        let inputs: [&[u8]; 4] = [b"(domain (name a)", b"(domain))", b")(", b"((("];
        for input in inputs {
            let err = parse(input).unwrap_err();
            assert!(
                matches!(err, HypervisorError::UnparseableOutput(_)),
                "{:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(
            parse(b"").unwrap_err(),
            HypervisorError::UnparseableOutput(_)
        ));
        assert!(matches!(
            parse(b"  \n\t ").unwrap_err(),
            HypervisorError::UnparseableOutput(_)
        ));
    }

    #[test]
    fn test_stray_atom() {
        let err = parse(b"Error: Domain 'win7' does not exist.").unwrap_err();
        assert!(matches!(err, HypervisorError::UnparseableOutput(_)));
    }

    #[test]
    fn test_unterminated_quote() {
        let err = parse(b"(domain (name \"win7))").unwrap_err();
        assert!(matches!(err, HypervisorError::UnparseableOutput(_)));
    }
}
