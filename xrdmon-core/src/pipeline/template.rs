//! `%(name)s` style templates over report fields
//!
//! Used to rename keys ([`FormatTransform`](super::FormatTransform)) and to
//! name line-protocol measurements. Supported conversions:
//! `s` (display), `r` (quoted), `d`/`i` (integer), `f` (six decimals).
//! `%%` is a literal percent sign.

use crate::report::{Report, Value};
use std::fmt;
use std::str::FromStr;

/// Errors raised while parsing or rendering a template
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("invalid template {template:?} at byte {position}: {reason}")]
    Syntax {
        template: String,
        position: usize,
        reason: &'static str,
    },
    #[error("template references missing key {0:?}")]
    MissingKey(String),
    #[error("cannot format {value:?} of key {key:?} as number")]
    Conversion { key: String, value: String },
}

/// Name of the placeholder bound to the key being renamed
pub const THIS_KEY: &str = "thiskey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Display,
    Repr,
    Integer,
    Float,
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Field { name: String, conversion: Conversion },
}

/// Parsed template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let syntax = |position: usize, reason: &'static str| TemplateError::Syntax {
            template: source.to_string(),
            position,
            reason,
        };

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((position, c)) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.next() {
                Some((_, '%')) => literal.push('%'),
                Some((_, '(')) => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some((_, ')')) => break,
                            Some((_, c)) => name.push(c),
                            None => return Err(syntax(position, "unterminated field name")),
                        }
                    }
                    let conversion = match chars.next() {
                        Some((_, 's')) => Conversion::Display,
                        Some((_, 'r')) => Conversion::Repr,
                        Some((_, 'd')) | Some((_, 'i')) => Conversion::Integer,
                        Some((_, 'f')) => Conversion::Float,
                        Some(_) => return Err(syntax(position, "unsupported conversion")),
                        None => return Err(syntax(position, "missing conversion")),
                    };
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Field { name, conversion });
                }
                _ => return Err(syntax(position, "expected '(' or '%' after '%'")),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    /// `%(ins)s.%(pgm)s.%(thiskey)s`
    pub(crate) fn rename_default() -> Self {
        let field = |name: &str| Part::Field {
            name: name.to_string(),
            conversion: Conversion::Display,
        };
        Self {
            source: "%(ins)s.%(pgm)s.%(thiskey)s".to_string(),
            parts: vec![
                field("ins"),
                Part::Literal(".".to_string()),
                field("pgm"),
                Part::Literal(".".to_string()),
                field(THIS_KEY),
            ],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether rendering with `thiskey` always yields the key itself
    pub fn is_identity(&self) -> bool {
        matches!(
            self.parts.as_slice(),
            [Part::Field { name, conversion: Conversion::Display }] if name == THIS_KEY
        )
    }

    /// Field names referenced by the template
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            Part::Field { name, .. } => Some(name.as_str()),
            Part::Literal(_) => None,
        })
    }

    /// Render against a report, binding `thiskey` if given
    pub fn render(&self, report: &Report, this_key: Option<&str>) -> Result<String, TemplateError> {
        let mut output = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                Part::Literal(text) => output.push_str(text),
                Part::Field { name, conversion } => {
                    let bound;
                    let value = match this_key {
                        Some(key) if name == THIS_KEY => {
                            bound = Value::from(key);
                            &bound
                        }
                        _ => report
                            .get(name)
                            .ok_or_else(|| TemplateError::MissingKey(name.clone()))?,
                    };
                    output.push_str(&convert(name, value, *conversion)?);
                }
            }
        }
        Ok(output)
    }
}

fn convert(key: &str, value: &Value, conversion: Conversion) -> Result<String, TemplateError> {
    let not_numeric = || TemplateError::Conversion {
        key: key.to_string(),
        value: value.to_string(),
    };
    Ok(match conversion {
        Conversion::Display => value.to_string(),
        Conversion::Repr => match value {
            Value::Str(text) => format!("'{}'", text),
            other => other.to_string(),
        },
        Conversion::Integer => match value {
            Value::Int(int) => int.to_string(),
            Value::Float(float) => (float.trunc() as i64).to_string(),
            Value::Str(_) => return Err(not_numeric()),
        },
        Conversion::Float => format!("{:.6}", value.as_f64().ok_or_else(not_numeric)?),
    })
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Self::parse(source)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> Report {
        [
            ("ins", Value::from("server")),
            ("pgm", Value::from("cmsd")),
            ("pid", Value::Int(12)),
            ("load", Value::Float(0.5)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_default_rename() {
        let template = Template::parse("%(ins)s.%(pgm)s.%(thiskey)s").unwrap();
        assert_eq!(template.render(&report(), Some("ver")).unwrap(), "server.cmsd.ver");
        assert!(!template.is_identity());
        assert_eq!(template.fields().collect::<Vec<_>>(), vec!["ins", "pgm", "thiskey"]);
    }

    #[test]
    fn test_rename_default_matches_parsed() {
        assert_eq!(
            Template::rename_default(),
            Template::parse("%(ins)s.%(pgm)s.%(thiskey)s").unwrap()
        );
    }

    #[test]
    fn test_identity() {
        assert!(Template::parse("%(thiskey)s").unwrap().is_identity());
        assert!(!Template::parse("x%(thiskey)s").unwrap().is_identity());
    }

    #[test]
    fn test_conversions() {
        let template = Template::parse("%(pid)d|%(load)f|%(ins)r|100%%").unwrap();
        assert_eq!(template.render(&report(), None).unwrap(), "12|0.500000|'server'|100%");
        let err = Template::parse("%(ins)d").unwrap().render(&report(), None).unwrap_err();
        assert!(matches!(err, TemplateError::Conversion { .. }));
    }

    #[test]
    fn test_missing_key() {
        let template = Template::parse("%(nope)s").unwrap();
        assert_eq!(
            template.render(&report(), None),
            Err(TemplateError::MissingKey("nope".to_string()))
        );
        // thiskey is only bound when renaming
        let template = Template::parse("%(thiskey)s").unwrap();
        assert!(template.render(&report(), None).is_err());
    }

    #[test]
    fn test_syntax_errors() {
        for source in ["%(open", "%(a)", "%(a)x", "50%", "%s"] {
            assert!(
                matches!(Template::parse(source), Err(TemplateError::Syntax { .. })),
                "{source:?} should be rejected"
            );
        }
    }
}
