//! Textual graph descriptions
//!
//! A description is a launch-line style string:
//!
//! ```text
//! testsrc ! decodebin ! tee name=output output. ! queue ! fakesink
//! ```
//!
//! Elements are separated by `!`, take `key=value` properties, may be named
//! with `name=...` and referenced later as `name.`. A bare media type such as
//! `video/x-raw,width=160` becomes a `capsfilter`.
//!
//! Descriptions may carry `{placeholder}` parameters which are substituted by
//! [`resolve`] before parsing.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

pub const CAPSFILTER: &str = "capsfilter";

/// One element as written in the description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSpec {
    pub kind: String,
    pub name: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl ElementSpec {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parse a property into `T`, `Ok(None)` when absent.
    pub fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.property(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| {
                    Error::parse(format!("{}: bad value {:?} for {}: {}", self.kind, raw, key, e))
                })
            })
            .transpose()
    }
}

/// Elements plus the links between them, by index into `elements`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedGraph {
    pub elements: Vec<ElementSpec>,
    pub links: Vec<(usize, usize)>,
}

impl ParsedGraph {
    pub fn position(&self, name: &str) -> Option<usize> {
        self.elements
            .iter()
            .position(|e| e.name.as_deref() == Some(name))
    }
}

/// Substitute `{name}` placeholders from `params`. `{{` and `}}` escape braces.
/// A placeholder with no value is a configuration error.
pub fn resolve(template: &str, params: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(k) => key.push(k),
                        None => {
                            return Err(Error::config(format!(
                                "unterminated placeholder {{{}",
                                key
                            )));
                        }
                    }
                }
                let value = params.get(key.trim()).ok_or_else(|| {
                    Error::config(format!("missing value for placeholder {{{}}}", key))
                })?;
                out.push_str(value);
            }
            '}' => return Err(Error::config("unmatched '}' in description")),
            _ => out.push(c),
        }
    }

    Ok(out)
}

fn tokenize(desc: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in desc.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => quote = Some(c),
            (None, '!') => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push("!".to_string());
            }
            // line continuations from shell-style descriptions
            (None, c) if c.is_whitespace() || c == '\\' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }

    if quote.is_some() {
        return Err(Error::parse("unterminated quote"));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn is_reference(token: &str) -> bool {
    token.len() > 1 && token.ends_with('.') && !token.contains('=') && !token.contains('/')
}

fn is_caps(token: &str) -> bool {
    token
        .split(',')
        .next()
        .is_some_and(|media| media.contains('/') && !media.contains('='))
}

/// Compile a description into elements and links.
pub fn parse(desc: &str) -> Result<ParsedGraph> {
    let mut graph = ParsedGraph::default();
    // last element of the chain being built
    let mut chain: Option<usize> = None;
    // element currently receiving properties
    let mut open: Option<usize> = None;
    let mut pending_link = false;

    for token in tokenize(desc)? {
        if token == "!" {
            if chain.is_none() || pending_link {
                return Err(Error::parse("link without an upstream element"));
            }
            pending_link = true;
            open = None;
            continue;
        }

        if is_reference(&token) {
            let name = &token[..token.len() - 1];
            let index = graph
                .position(name)
                .ok_or_else(|| Error::parse(format!("reference to unknown element {}", name)))?;
            if pending_link {
                if let Some(from) = chain {
                    graph.links.push((from, index));
                }
                pending_link = false;
            }
            chain = Some(index);
            open = None;
            continue;
        }

        let index = if is_caps(&token) {
            let mut spec = ElementSpec::new(CAPSFILTER);
            spec.properties.insert("caps".to_string(), token.clone());
            graph.elements.push(spec);
            graph.elements.len() - 1
        } else if let Some((key, value)) = token.split_once('=') {
            let index = open.ok_or_else(|| {
                Error::parse(format!("property {} does not follow an element", key))
            })?;
            if key == "name" {
                if graph.position(value).is_some() {
                    return Err(Error::parse(format!("duplicate element name {}", value)));
                }
                graph.elements[index].name = Some(value.to_string());
            } else {
                graph.elements[index]
                    .properties
                    .insert(key.to_string(), value.to_string());
            }
            continue;
        } else {
            graph.elements.push(ElementSpec::new(&token));
            graph.elements.len() - 1
        };

        if pending_link {
            if let Some(from) = chain {
                graph.links.push((from, index));
            }
            pending_link = false;
        }
        chain = Some(index);
        open = Some(index);
    }

    if pending_link {
        return Err(Error::parse("link without a downstream element"));
    }
    if graph.elements.is_empty() {
        return Err(Error::parse("empty description"));
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chain_with_properties() {
        let graph = parse("testsrc fps=5 ! queue name=live-input ! fakesink").unwrap();
        assert_eq!(graph.elements.len(), 3);
        assert_eq!(graph.elements[0].property("fps"), Some("5"));
        assert_eq!(graph.elements[1].name.as_deref(), Some("live-input"));
        assert_eq!(graph.links, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_parse_references_and_caps() {
        let graph = parse(
            "testsrc ! tee name=output \
             output. ! queue ! video/x-raw,width=160,height=120 ! fakesink",
        )
        .unwrap();

        let tee = graph.position("output").unwrap();
        assert_eq!(graph.elements[3].kind, CAPSFILTER);
        assert_eq!(
            graph.elements[3].property("caps"),
            Some("video/x-raw,width=160,height=120")
        );
        assert!(graph.links.contains(&(tee, 2)));
        assert_eq!(graph.links.len(), 4);
    }

    #[test]
    fn test_parse_quoted_values() {
        let graph = parse("filesink location=\"/tmp/a b.jpg\"").unwrap();
        assert_eq!(graph.elements[0].property("location"), Some("/tmp/a b.jpg"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("! fakesink").is_err());
        assert!(parse("queue !").is_err());
        assert!(parse("missing. ! fakesink").is_err());
        assert!(parse("queue name=a ! queue name=a").is_err());
        assert!(parse("queue ! fps=3").is_err());
    }

    #[test]
    fn test_resolve_placeholders() {
        let mut params = HashMap::new();
        params.insert("snapshot_output".to_string(), "/tmp/shot".to_string());

        let desc = resolve("filesink location={snapshot_output}.jpg", &params).unwrap();
        assert_eq!(desc, "filesink location=/tmp/shot.jpg");

        assert_eq!(resolve("{{literal}}", &params).unwrap(), "{literal}");

        match resolve("filesink location={encode_output}.mp4", &params) {
            Err(Error::Configuration(msg)) => assert!(msg.contains("encode_output")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_parsed_property() {
        let graph = parse("testsrc fps=abc num-buffers=3").unwrap();
        let spec = &graph.elements[0];
        assert_eq!(spec.parsed::<u64>("num-buffers").unwrap(), Some(3));
        assert_eq!(spec.parsed::<u64>("width").unwrap(), None);
        assert!(spec.parsed::<u32>("fps").is_err());
    }
}
