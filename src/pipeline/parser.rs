//! Textual graph description parser using winnow.
//!
//! Parses launch-style pipeline descriptions into
//! [`ModuleConfig`](crate::module::ModuleConfig) records:
//!
//! ```text
//! testsrc name=cam parallelism=0 ! detect parallelism=4 queue_size=20 threshold=0.5 ! nullsink
//! ```
//!
//! # Syntax
//!
//! - Modules are separated by `!` and linked in order, source to sink
//! - The first identifier of each module is its implementation class
//! - Properties are `key=value`; values may be quoted strings or bare
//!   tokens
//! - Reserved properties: `name` (instance name, defaults to the class
//!   name), `parallelism`, `queue_size`; everything else lands in the
//!   module's parameter map as opaque strings
//!
//! Fan-in and fan-out shapes are wired through the programmatic API; a
//! description always yields a linear chain.

use crate::error::{Error, Result};
use crate::module::ModuleConfig;
use winnow::ascii::{alpha1, multispace0};
use winnow::combinator::{alt, delimited, repeat, separated};
use winnow::error::{ContextError, ErrMode};
use winnow::token::{take_till, take_while};
use winnow::Parser;

type WResult<T> = std::result::Result<T, ErrMode<ContextError>>;

/// One parsed module: class name plus raw properties.
#[derive(Debug, Clone, PartialEq)]
struct ParsedModule {
    class_name: String,
    properties: Vec<(String, String)>,
}

/// Parse a description string into linked module configs.
pub fn parse_description(input: &str) -> Result<Vec<ModuleConfig>> {
    let parsed = description
        .parse(input.trim())
        .map_err(|e| Error::Parse(format!("{e}")))?;

    let mut configs = Vec::with_capacity(parsed.len());
    for module in &parsed {
        configs.push(into_config(module)?);
    }
    // A description is a linear chain: each module feeds the next.
    for i in 0..configs.len().saturating_sub(1) {
        let next = configs[i + 1].name.clone();
        configs[i].next.push(next);
    }
    Ok(configs)
}

fn into_config(module: &ParsedModule) -> Result<ModuleConfig> {
    let mut config = ModuleConfig::new(&module.class_name, &module.class_name);
    for (key, value) in &module.properties {
        match key.as_str() {
            "name" => config.name = value.clone(),
            "parallelism" => {
                config.parallelism = value.parse().map_err(|_| {
                    Error::Parse(format!("invalid parallelism: {value}"))
                })?;
            }
            "queue_size" => {
                config.max_input_queue_size = value.parse().map_err(|_| {
                    Error::Parse(format!("invalid queue_size: {value}"))
                })?;
                if config.max_input_queue_size == 0 {
                    return Err(Error::Parse("queue_size must be at least 1".into()));
                }
            }
            _ => {
                config.parameters.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(config)
}

/// Parse a complete description.
fn description(input: &mut &str) -> WResult<Vec<ParsedModule>> {
    let modules = separated(1.., module, link_separator).parse_next(input)?;
    multispace0.parse_next(input)?;
    if !input.is_empty() {
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    Ok(modules)
}

/// Parse one module (class name + optional properties).
fn module(input: &mut &str) -> WResult<ParsedModule> {
    let _ = multispace0.parse_next(input)?;
    let class_name: &str = identifier.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let properties: Vec<(String, String)> = repeat(0.., property).parse_next(input)?;
    Ok(ParsedModule {
        class_name: class_name.to_string(),
        properties,
    })
}

/// Parse the link separator `!`.
fn link_separator(input: &mut &str) -> WResult<()> {
    let _ = multispace0.parse_next(input)?;
    let _ = '!'.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    Ok(())
}

/// Parse an identifier (class or property name).
fn identifier<'a>(input: &mut &'a str) -> WResult<&'a str> {
    (
        alt((alpha1::<_, ContextError>, "_")),
        take_while(0.., |c: char| c.is_alphanumeric() || c == '_' || c == '-'),
    )
        .take()
        .parse_next(input)
}

/// Parse a `key=value` property, backtracking if this is not one.
fn property(input: &mut &str) -> WResult<(String, String)> {
    let _ = multispace0.parse_next(input)?;
    let checkpoint = *input;

    let key: &str = match identifier.parse_next(input) {
        Ok(key) => key,
        Err(_) => {
            *input = checkpoint;
            return Err(ErrMode::Backtrack(ContextError::new()));
        }
    };
    let _ = multispace0.parse_next(input)?;
    if input.starts_with('=') {
        let _ = '='.parse_next(input)?;
    } else {
        *input = checkpoint;
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    let _ = multispace0.parse_next(input)?;
    let value = property_value.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    Ok((key.to_string(), value))
}

/// Parse a property value: quoted string or bare token.
fn property_value(input: &mut &str) -> WResult<String> {
    alt((quoted_string, bare_token)).parse_next(input)
}

/// Parse a quoted string.
fn quoted_string(input: &mut &str) -> WResult<String> {
    alt((
        delimited('"', take_till(0.., '"'), '"'),
        delimited('\'', take_till(0.., '\''), '\''),
    ))
    .map(|s: &str| s.to_string())
    .parse_next(input)
}

/// Parse an unquoted value token.
fn bare_token(input: &mut &str) -> WResult<String> {
    take_while(1.., |c: char| !c.is_whitespace() && c != '!')
        .map(|s: &str| s.to_string())
        .parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain_links_in_order() {
        let configs =
            parse_description("testsrc parallelism=0 ! passthrough ! nullsink").unwrap();
        assert_eq!(configs.len(), 3);
        assert_eq!(configs[0].class_name, "testsrc");
        assert_eq!(configs[0].parallelism, 0);
        assert_eq!(configs[0].next, vec!["passthrough".to_string()]);
        assert_eq!(configs[1].next, vec!["nullsink".to_string()]);
        assert!(configs[2].next.is_empty());
    }

    #[test]
    fn reserved_and_custom_properties_split() {
        let configs = parse_description(
            "detect name=detector parallelism=4 queue_size=32 model=yolo threshold=0.5",
        )
        .unwrap();
        let config = &configs[0];
        assert_eq!(config.name, "detector");
        assert_eq!(config.class_name, "detect");
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.max_input_queue_size, 32);
        assert_eq!(config.parameters["model"], "yolo");
        assert_eq!(config.parameters["threshold"], "0.5");
    }

    #[test]
    fn quoted_values() {
        let configs = parse_description("filesrc location=\"/tmp/in file.raw\"").unwrap();
        assert_eq!(configs[0].parameters["location"], "/tmp/in file.raw");
    }

    #[test]
    fn instance_name_defaults_to_class() {
        let configs = parse_description("nullsink").unwrap();
        assert_eq!(configs[0].name, "nullsink");
    }

    #[test]
    fn garbage_rejected() {
        assert!(parse_description("").is_err());
        assert!(parse_description("a ! ").is_err());
        assert!(parse_description("a parallelism=lots").is_err());
        assert!(parse_description("a queue_size=0").is_err());
    }

    #[test]
    fn whitespace_is_flexible() {
        let configs = parse_description("  a!b !  c  ").unwrap();
        assert_eq!(configs.len(), 3);
    }
}
