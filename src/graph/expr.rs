//! Reference expressions embedded in declared values.
//!
//! A string value may contain `${kind.name.attribute}` (a resource attribute,
//! known once that resource exists) or `${var.NAME}` (a workspace variable,
//! substituted at load time). `$${` produces a literal `${`.

use serde_json::Value;
use std::collections::BTreeMap;

use super::resource::ResourceId;

/// A piece of a parsed string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text, escapes already removed.
    Literal(String),
    /// The body of a `${...}` expression, trimmed.
    Expr(String),
}

/// A parsed expression body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expression {
    /// `kind.name.attribute`
    Attribute(AttributeRef),
    /// `var.NAME`
    Variable(String),
}

/// A reference to one attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeRef {
    /// Referenced resource.
    pub target: ResourceId,
    /// Attribute name on the referenced resource.
    pub attribute: String,
}

/// Splits a string into literal and expression segments.
///
/// # Errors
///
/// Returns a description of the problem for an unclosed or empty `${`.
pub fn parse_segments(input: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = input;
    let mut offset = 0;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("$${") {
            literal.push_str("${");
            offset += 3;
            rest = after;
            continue;
        }

        if let Some(after) = rest.strip_prefix("${") {
            let Some(end) = after.find('}') else {
                return Err(format!("unclosed '${{' at offset {offset}"));
            };
            let body = after[..end].trim();
            if body.is_empty() {
                return Err(format!("empty expression at offset {offset}"));
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Expr(body.to_string()));
            offset += end + 3;
            rest = &after[end + 1..];
            continue;
        }

        let Some(ch) = rest.chars().next() else {
            break;
        };
        literal.push(ch);
        offset += ch.len_utf8();
        rest = &rest[ch.len_utf8()..];
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

impl Expression {
    /// Parses an expression body.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the body is not
    /// `kind.name.attribute` or `var.NAME`.
    pub fn parse(body: &str) -> Result<Self, String> {
        let parts: Vec<&str> = body.split('.').collect();
        if parts.iter().any(|p| !is_identifier(p)) {
            return Err(format!("invalid expression '{body}'"));
        }

        match parts.as_slice() {
            ["var", name] => Ok(Self::Variable((*name).to_string())),
            [kind, name, attribute] => Ok(Self::Attribute(AttributeRef {
                target: ResourceId::new(*kind, *name),
                attribute: (*attribute).to_string(),
            })),
            _ => Err(format!(
                "invalid expression '{body}': expected kind.name.attribute or var.NAME"
            )),
        }
    }
}

impl std::fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.target, self.attribute)
    }
}

/// Collects every attribute reference inside a value, in document order.
///
/// # Errors
///
/// Returns a description of the first malformed expression.
pub fn collect_references(value: &Value, out: &mut Vec<AttributeRef>) -> Result<(), String> {
    match value {
        Value::String(s) => {
            for segment in parse_segments(s)? {
                if let Segment::Expr(body) = segment
                    && let Expression::Attribute(reference) = Expression::parse(&body)?
                {
                    out.push(reference);
                }
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(|v| collect_references(v, out)),
        Value::Object(map) => map.values().try_for_each(|v| collect_references(v, out)),
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
    }
}

/// Replaces `${var.NAME}` expressions, leaving attribute references intact.
///
/// # Errors
///
/// Returns the name of the first variable that is not defined, or a
/// description of a malformed expression.
pub fn substitute_variables(
    value: &Value,
    variables: &BTreeMap<String, String>,
) -> Result<Value, SubstitutionError> {
    match value {
        Value::String(s) => {
            let segments = parse_segments(s).map_err(SubstitutionError::Malformed)?;
            let mut rebuilt = String::new();
            for segment in segments {
                match segment {
                    Segment::Literal(text) => rebuilt.push_str(&escape(&text)),
                    Segment::Expr(body) => {
                        match Expression::parse(&body).map_err(SubstitutionError::Malformed)? {
                            Expression::Variable(name) => {
                                let value = variables
                                    .get(&name)
                                    .ok_or(SubstitutionError::UndefinedVariable(name))?;
                                rebuilt.push_str(&escape(value));
                            }
                            Expression::Attribute(_) => {
                                rebuilt.push_str("${");
                                rebuilt.push_str(&body);
                                rebuilt.push('}');
                            }
                        }
                    }
                }
            }
            Ok(Value::String(rebuilt))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| substitute_variables(v, variables))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, v) in map {
                out.insert(key.clone(), substitute_variables(v, variables)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Why variable substitution failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstitutionError {
    /// `${var.NAME}` with no such variable.
    UndefinedVariable(String),
    /// An expression could not be parsed.
    Malformed(String),
}

/// Why a reference could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveFailure {
    /// The expression as written.
    pub reference: String,
    /// Description of the problem.
    pub reason: String,
}

/// Resolves attribute references inside a value.
///
/// A string that is exactly one reference takes the referenced value with
/// its type; references embedded in text are interpolated.
///
/// # Errors
///
/// Returns the first reference `lookup` cannot satisfy.
pub fn resolve_value<F>(value: &Value, lookup: &mut F) -> Result<Value, ResolveFailure>
where
    F: FnMut(&AttributeRef) -> Result<Value, String>,
{
    match value {
        Value::String(s) => {
            let segments = parse_segments(s).map_err(|reason| ResolveFailure {
                reference: s.clone(),
                reason,
            })?;

            if let [Segment::Expr(body)] = segments.as_slice() {
                return resolve_expression(body, lookup);
            }

            let mut text = String::new();
            for segment in &segments {
                match segment {
                    Segment::Literal(literal) => text.push_str(literal),
                    Segment::Expr(body) => {
                        text.push_str(&value_to_text(&resolve_expression(body, lookup)?));
                    }
                }
            }
            Ok(Value::String(text))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, v) in map {
                out.insert(key.clone(), resolve_value(v, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Resolves every value in an attribute map.
///
/// # Errors
///
/// Returns the first reference `lookup` cannot satisfy.
pub fn resolve_attributes<F>(
    attributes: &BTreeMap<String, Value>,
    lookup: &mut F,
) -> Result<BTreeMap<String, Value>, ResolveFailure>
where
    F: FnMut(&AttributeRef) -> Result<Value, String>,
{
    attributes
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(value, lookup)?)))
        .collect()
}

/// Renders a value as plain text for interpolation.
#[must_use]
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn resolve_expression<F>(body: &str, lookup: &mut F) -> Result<Value, ResolveFailure>
where
    F: FnMut(&AttributeRef) -> Result<Value, String>,
{
    let written = format!("${{{body}}}");
    match Expression::parse(body) {
        Ok(Expression::Attribute(reference)) => lookup(&reference).map_err(|reason| ResolveFailure {
            reference: written,
            reason,
        }),
        Ok(Expression::Variable(name)) => Err(ResolveFailure {
            reference: written,
            reason: format!("variable '{name}' was not substituted at load time"),
        }),
        Err(reason) => Err(ResolveFailure {
            reference: written,
            reason,
        }),
    }
}

fn escape(text: &str) -> String {
    text.replace("${", "$${")
}

fn is_identifier(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_segments_mixed() {
        let segments = parse_segments("Host ${instance.dev.public_ip}:22").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal(String::from("Host ")),
                Segment::Expr(String::from("instance.dev.public_ip")),
                Segment::Literal(String::from(":22")),
            ]
        );
    }

    #[test]
    fn test_parse_segments_escape() {
        let segments = parse_segments("echo $${HOME} $PATH").unwrap();
        assert_eq!(segments, vec![Segment::Literal(String::from("echo ${HOME} $PATH"))]);
    }

    #[test]
    fn test_parse_segments_unclosed() {
        assert!(parse_segments("${network.main.id").is_err());
        assert!(parse_segments("${ }").is_err());
    }

    #[test]
    fn test_expression_forms() {
        assert_eq!(
            Expression::parse("var.my_ip").unwrap(),
            Expression::Variable(String::from("my_ip"))
        );
        assert_eq!(
            Expression::parse("subnet.public.id").unwrap(),
            Expression::Attribute(AttributeRef {
                target: ResourceId::new("subnet", "public"),
                attribute: String::from("id"),
            })
        );
        assert!(Expression::parse("subnet.public").is_err());
        assert!(Expression::parse("a.b.c.d").is_err());
    }

    #[test]
    fn test_collect_references_nested() {
        let value = json!({
            "ingress": [{"cidr_blocks": ["${var.my_ip}/32"]}],
            "vpc": "${network.main.id}",
            "subnets": ["${subnet.a.id}", "${subnet.b.id}"],
        });
        let mut refs = Vec::new();
        collect_references(&value, &mut refs).unwrap();

        let targets: Vec<String> = refs.iter().map(|r| r.target.to_string()).collect();
        assert_eq!(targets, vec!["subnet.a", "subnet.b", "network.main"]);
    }

    #[test]
    fn test_substitute_variables_keeps_references() {
        let variables = BTreeMap::from([(String::from("my_ip"), String::from("198.51.100.7"))]);
        let value = json!("${var.my_ip}/32 via ${network.main.id} $${literal}");

        let result = substitute_variables(&value, &variables).unwrap();
        assert_eq!(result, json!("198.51.100.7/32 via ${network.main.id} $${literal}"));

        let missing = substitute_variables(&json!("${var.nope}"), &variables);
        assert_eq!(missing, Err(SubstitutionError::UndefinedVariable(String::from("nope"))));
    }

    #[test]
    fn test_resolve_keeps_type_for_whole_reference() {
        let mut lookup = |r: &AttributeRef| match r.attribute.as_str() {
            "ids" => Ok(json!(["sg-1", "sg-2"])),
            "id" => Ok(json!("vpc-1")),
            other => Err(format!("no attribute {other}")),
        };

        let whole = resolve_value(&json!("${security_group.web.ids}"), &mut lookup).unwrap();
        assert_eq!(whole, json!(["sg-1", "sg-2"]));

        let embedded = resolve_value(&json!("in ${network.main.id}!"), &mut lookup).unwrap();
        assert_eq!(embedded, json!("in vpc-1!"));

        let failure = resolve_value(&json!("${network.main.arn}"), &mut lookup).unwrap_err();
        assert_eq!(failure.reference, "${network.main.arn}");
    }
}
