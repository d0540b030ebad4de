//! Bundle assembly: env documents, the SQL bootstrap script and the
//! hierarchical `secrets.yaml` document.
//!
//! The hierarchical document is a flat YAML mapping from logical file names
//! to block literals. Every value carries an explicit indentation indicator
//! and a chomping indicator chosen from its trailing newlines, so contents
//! round-trip byte for byte:
//!
//! ```text
//! api.key: |2-
//!   s3cr3t
//! postgres.crt: |2
//!   -----BEGIN CERTIFICATE-----
//!   ...
//!   -----END CERTIFICATE-----
//! ```
//!
//! | Trailing newlines | Indicator |
//! |---|---|
//! | none | `-` (strip) |
//! | exactly one | none (clip) |
//! | two or more, or content `"\n"` | `+` (keep) |

use crate::error::{ProvisionError, ProvisionResult};
use crate::workspace::validate_artifact_name;

/// Env keys read by the Pidgeon service.
pub mod env {
    pub const DATABASE_URL: &str = "DATABASE_URL";
    pub const CLOUD_SSL: &str = "PIDGEON_CLOUD_SSL";
    pub const CLOUD_DOMAIN: &str = "PIDGEON_CLOUD_DOMAIN";
    pub const CLOUD_API_KEY: &str = "PIDGEON_CLOUD_API_KEY";
    pub const CLOUD_ID: &str = "PIDGEON_CLOUD_ID";
    pub const DB_DOMAIN: &str = "PIDGEON_DB_DOMAIN";
    pub const DB_PORT: &str = "PIDGEON_DB_PORT";
    pub const DB_USER: &str = "PIDGEON_DB_USER";
    pub const DB_PASSWORD: &str = "PIDGEON_DB_PASSWORD";
    pub const DB_NAME: &str = "PIDGEON_DB_NAME";
    pub const NETWORK_IP_RANGE_START: &str = "PIDGEON_NETWORK_IP_RANGE_START";
    pub const NETWORK_IP_RANGE_END: &str = "PIDGEON_NETWORK_IP_RANGE_END";
    pub const WIFI_SSID: &str = "PIDGEON_WIFI_SSID";
    pub const WIFI_PASS: &str = "PIDGEON_WIFI_PASS";

    /// Keys of the standalone wireless env document.
    pub const WIRELESS_SSID: &str = "WIFI_SSID";
    pub const WIRELESS_PASS: &str = "WIFI_PASS";
}

/// Render `KEY="value"` lines in the given order.
///
/// Values are double quoted with `\`, `"`, `$` and `` ` `` escaped, so the
/// document can be sourced by a shell as well as read by dotenv parsers.
pub fn render_env_document(entries: &[(&str, &str)]) -> ProvisionResult<String> {
    let mut out = String::new();

    for (key, value) in entries {
        if !is_env_key(key) {
            return Err(ProvisionError::generation(
                "env document",
                format!("invalid key {key:?}"),
            ));
        }

        out.push_str(key);
        out.push_str("=\"");
        for c in value.chars() {
            if matches!(c, '\\' | '"' | '$' | '`') {
                out.push('\\');
            }
            out.push(c);
        }
        out.push_str("\"\n");
    }

    Ok(out)
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// How a database role is brought into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// Built-in superuser; only its password is changed
    Builtin,
    /// Additional superuser for operators
    Admin,
    /// Login role owning the application database
    Application,
}

/// A database role and its generated password.
#[derive(Debug, Clone)]
pub struct DatabaseRole<'a> {
    /// Role name, quoted as an identifier
    pub name: &'a str,
    /// Plaintext password, quoted as a literal
    pub password: &'a str,
    pub kind: RoleKind,
}

/// SQL creating the roles and the database owned by the application role.
pub fn render_sql_bootstrap(database: &str, roles: &[DatabaseRole<'_>]) -> ProvisionResult<String> {
    let mut owner = None;
    let mut out = String::new();

    for role in roles {
        let name = quote_identifier(role.name);
        let password = quote_literal(role.password);
        match role.kind {
            RoleKind::Builtin => {
                out.push_str(&format!("ALTER ROLE {name} WITH PASSWORD {password};\n"));
            }
            RoleKind::Admin => {
                out.push_str(&format!(
                    "CREATE ROLE {name} WITH LOGIN SUPERUSER PASSWORD {password};\n"
                ));
            }
            RoleKind::Application => {
                if owner.replace(name.clone()).is_some() {
                    return Err(ProvisionError::generation(
                        "postgres.sql",
                        "more than one application role",
                    ));
                }
                out.push_str(&format!("CREATE ROLE {name} WITH LOGIN PASSWORD {password};\n"));
            }
        }
    }

    let owner = owner
        .ok_or_else(|| ProvisionError::generation("postgres.sql", "no application role"))?;
    out.push_str(&format!(
        "CREATE DATABASE {} OWNER {owner};\n",
        quote_identifier(database)
    ));

    Ok(out)
}

fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

/// Render `entries` as a mapping of block literals indented by `indent`
/// spaces (1 to 9).
pub fn render_hierarchical_document(
    entries: &[(&str, &str)],
    indent: usize,
) -> ProvisionResult<String> {
    if !(1..=9).contains(&indent) {
        return Err(ProvisionError::generation(
            "secrets.yaml",
            format!("indent {indent} outside 1..=9"),
        ));
    }
    let pad = " ".repeat(indent);
    let mut out = String::new();

    for (name, content) in entries {
        validate_artifact_name(name)?;
        if content.contains('\r') {
            return Err(ProvisionError::generation(
                *name,
                "carriage returns cannot be embedded",
            ));
        }

        let body = content.trim_end_matches('\n');
        let trailing = content.len() - body.len();
        let chomp = match (body.is_empty(), trailing) {
            (_, 0) => "-",
            (false, 1) => "",
            _ => "+",
        };

        out.push_str(&format!("{name}: |{indent}{chomp}\n"));

        if !body.is_empty() {
            for line in body.split('\n') {
                if !line.is_empty() {
                    out.push_str(&pad);
                    out.push_str(line);
                }
                out.push('\n');
            }
        }

        // the last body line already carries one of the trailing newlines
        let extra = if body.is_empty() {
            trailing
        } else {
            trailing.saturating_sub(1)
        };
        for _ in 0..extra {
            out.push('\n');
        }
    }

    Ok(out)
}

/// Parse a document produced by [`render_hierarchical_document`].
pub fn parse_hierarchical_document(text: &str) -> ProvisionResult<Vec<(String, String)>> {
    let mut entries = Vec::new();
    let mut lines = text.lines().peekable();

    while let Some(header) = lines.next() {
        let (name, indicators) = header
            .split_once(": |")
            .ok_or_else(|| malformed(format!("expected block literal header, found {header:?}")))?;
        validate_artifact_name(name)?;

        let mut chars = indicators.chars();
        let indent = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .filter(|indent| *indent > 0)
            .ok_or_else(|| malformed(format!("{name}: missing indentation indicator")))?
            as usize;
        let chomp = chars.next();
        if chars.next().is_some() || !matches!(chomp, None | Some('-') | Some('+')) {
            return Err(malformed(format!("{name}: bad indicators {indicators:?}")));
        }

        let pad = " ".repeat(indent);
        let mut content_lines = Vec::new();
        while let Some(line) = lines.peek() {
            if line.is_empty() {
                content_lines.push("");
            } else if let Some(stripped) = line.strip_prefix(pad.as_str()) {
                content_lines.push(stripped);
            } else {
                break;
            }
            lines.next();
        }

        let body_len = content_lines
            .iter()
            .rposition(|line| !line.is_empty())
            .map_or(0, |last| last + 1);
        let trailing = content_lines.len() - body_len;
        let body = content_lines[..body_len].join("\n");

        let content = match chomp {
            Some('-') => body,
            Some('+') if body_len == 0 => "\n".repeat(trailing),
            Some('+') => format!("{body}\n{}", "\n".repeat(trailing)),
            _ if body_len == 0 => String::new(),
            _ => format!("{body}\n"),
        };

        entries.push((name.to_string(), content));
    }

    Ok(entries)
}

fn malformed(reason: String) -> ProvisionError {
    ProvisionError::generation("secrets.yaml", reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const CERT: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIBATAKBggqhkjOPQQDAjAfMR0wGwYDVQQDDBRQaWRnZW9u\nIFBvc3RncmVzIENBMB4XDTI1MDEwMTAwMDAwMFoXDTI2MDEwMTAwMDAwMFowKjEo\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_env_document_order_and_escaping() {
        let doc = render_env_document(&[
            (env::CLOUD_DOMAIN, "example.com"),
            (env::DB_PASSWORD, "a\"b$c`d\\e"),
        ])
        .unwrap();

        assert_eq!(
            doc,
            "PIDGEON_CLOUD_DOMAIN=\"example.com\"\nPIDGEON_DB_PASSWORD=\"a\\\"b\\$c\\`d\\\\e\"\n"
        );
    }

    #[test]
    fn test_env_document_rejects_bad_keys() {
        assert!(render_env_document(&[("1KEY", "x")]).is_err());
        assert!(render_env_document(&[("KEY-NAME", "x")]).is_err());
        assert!(render_env_document(&[("", "x")]).is_err());
        assert!(render_env_document(&[("_OK", "x")]).is_ok());
    }

    fn role(name: &'static str, password: &'static str, kind: RoleKind) -> DatabaseRole<'static> {
        DatabaseRole {
            name,
            password,
            kind,
        }
    }

    #[test]
    fn test_sql_bootstrap() {
        let sql = render_sql_bootstrap(
            "pidgeon",
            &[
                role("postgres", "p0", RoleKind::Builtin),
                role("altibiz", "p1", RoleKind::Admin),
                role("pidgeon", "it's", RoleKind::Application),
            ],
        )
        .unwrap();

        assert_eq!(
            sql,
            "ALTER ROLE \"postgres\" WITH PASSWORD 'p0';\n\
             CREATE ROLE \"altibiz\" WITH LOGIN SUPERUSER PASSWORD 'p1';\n\
             CREATE ROLE \"pidgeon\" WITH LOGIN PASSWORD 'it''s';\n\
             CREATE DATABASE \"pidgeon\" OWNER \"pidgeon\";\n"
        );
    }

    #[test]
    fn test_sql_bootstrap_needs_one_owner() {
        let none = render_sql_bootstrap("pidgeon", &[role("postgres", "p", RoleKind::Builtin)]);
        assert!(none.is_err());

        let app = role("a", "p", RoleKind::Application);
        assert!(render_sql_bootstrap("pidgeon", &[app.clone(), app]).is_err());
    }

    #[test]
    fn test_hierarchical_rendering() {
        let doc = render_hierarchical_document(&[("api.key", "abc"), ("postgres.sql", "x;\n")], 2)
            .unwrap();
        assert_eq!(doc, "api.key: |2-\n  abc\npostgres.sql: |2\n  x;\n");
    }

    #[test]
    fn test_hierarchical_round_trip_edge_contents() {
        let contents = [
            "",
            "\n",
            "\n\n",
            "a",
            "a\n",
            "a\n\n",
            "a\n\n\n",
            "  leading spaces\n",
            "first\n\nafter blank",
            "# not a comment\nkey: value",
            CERT,
        ];

        for indent in [1, 2, 4, 9] {
            let entries: Vec<(String, &str)> = contents
                .iter()
                .enumerate()
                .map(|(i, content)| (format!("entry-{i}"), *content))
                .collect();
            let borrowed: Vec<(&str, &str)> =
                entries.iter().map(|(name, content)| (name.as_str(), *content)).collect();

            let doc = render_hierarchical_document(&borrowed, indent).unwrap();
            let parsed = parse_hierarchical_document(&doc).unwrap();

            assert_eq!(parsed.len(), contents.len());
            for ((name, content), (parsed_name, parsed_content)) in entries.iter().zip(&parsed) {
                assert_eq!(name, parsed_name);
                assert_eq!(content, parsed_content, "indent {indent}, entry {name}");
            }
        }
    }

    #[test]
    fn test_hierarchical_document_is_valid_yaml() {
        let entries = [
            ("postgres.crt", CERT),
            ("api.key", "k3y"),
            ("postgres.sql", "CREATE ROLE \"x\";\n"),
            ("blank", ""),
            ("keep", "tail\n\n"),
        ];

        let doc = render_hierarchical_document(&entries, 2).unwrap();
        let yaml: BTreeMap<String, String> = serde_yaml::from_str(&doc).unwrap();

        for (name, content) in entries {
            assert_eq!(yaml[name], content, "{name}");
        }
    }

    #[test]
    fn test_hierarchical_rejects_bad_input() {
        assert!(render_hierarchical_document(&[("a", "x")], 0).is_err());
        assert!(render_hierarchical_document(&[("a", "x")], 10).is_err());
        assert!(render_hierarchical_document(&[("a b", "x")], 2).is_err());
        assert!(render_hierarchical_document(&[("a", "x\r\n")], 2).is_err());
        assert!(parse_hierarchical_document("not yaml at all\n").is_err());
        assert!(parse_hierarchical_document("a: |x\n").is_err());
    }
}
