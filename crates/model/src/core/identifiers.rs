/// Collapses an arbitrary job or table identifier into a form that is safe
/// to embed in object names on either side: anything outside
/// `[A-Za-z0-9_]` becomes `_`, and a leading digit gets an underscore
/// prefix.
pub fn sanitize(identifier: &str) -> String {
    let mut out = String::with_capacity(identifier.len() + 1);
    for c in identifier.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Snowflake folds unquoted identifiers to upper case; we emit them quoted
/// and pre-folded so raw SQL and information-schema lookups agree.
pub fn snowflake_ident(identifier: &str) -> String {
    sanitize(identifier).to_ascii_uppercase()
}

/// Raw landing table name for a flow job.
pub fn raw_table_name(job_name: &str) -> String {
    format!("_SLUICE_RAW_{}", snowflake_ident(job_name))
}

/// Quotes a Postgres identifier, splitting on a schema qualifier if present.
pub fn quote_postgres_ident(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_punctuation() {
        assert_eq!(sanitize("public.users-v2"), "public_users_v2");
    }

    #[test]
    fn sanitize_guards_leading_digit() {
        assert_eq!(sanitize("2024_orders"), "_2024_orders");
    }

    #[test]
    fn raw_table_name_is_stable() {
        assert_eq!(raw_table_name("my-flow"), "_SLUICE_RAW_MY_FLOW");
    }

    #[test]
    fn postgres_ident_quotes_schema_and_table() {
        assert_eq!(quote_postgres_ident("public.users"), "\"public\".\"users\"");
    }
}
