use migrabase_filter::qb::{q, Arg, Query};
use migrabase_filter::{args, cel, compile};
use proptest::prelude::*;

// Strategy: a condition with `n` placeholders and `n` integer arguments
fn arb_part() -> impl Strategy<Value = (String, Vec<i64>)> {
    prop::collection::vec(any::<i64>(), 0..4).prop_map(|values| {
        let text = (0..values.len())
            .map(|i| format!("c{} = ?", i))
            .collect::<Vec<_>>()
            .join(" AND ");
        let text = if text.is_empty() { "TRUE".to_string() } else { text };
        (text, values)
    })
}

fn build(parts: &[(String, Vec<i64>)], nest_every: usize) -> Query {
    let mut query = Query::new();
    for (i, (text, values)) in parts.iter().enumerate() {
        let part_args: Vec<Arg> = values.iter().map(|v| Arg::from(*v)).collect();
        if nest_every > 0 && i % nest_every == 0 {
            let inner = q(text.clone(), part_args);
            query.and("(?)", args![inner]);
        } else {
            query.and(text.clone(), part_args);
        }
    }
    query
}

/// Placeholder numbers in the rendered text, in order of appearance.
fn placeholder_numbers(sql: &str) -> Vec<usize> {
    let mut numbers = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            digits.push(*d);
            chars.next();
        }
        numbers.push(digits.parse().unwrap());
    }
    numbers
}

proptest! {
    /// Property: `$n` placeholders are numbered 1..=len(args) in order
    #[test]
    fn prop_placeholders_match_arguments(
        parts in prop::collection::vec(arb_part(), 0..8),
        nest_every in 0usize..3,
    ) {
        let query = build(&parts, nest_every);
        let (sql, values) = query.to_sql().unwrap();

        let expected: Vec<i64> = parts.iter().flat_map(|(_, v)| v.iter().copied()).collect();
        prop_assert_eq!(values.len(), expected.len());
        prop_assert_eq!(placeholder_numbers(&sql), (1..=expected.len()).collect::<Vec<_>>());
    }

    /// Property: dropping an argument is always reported, never rendered
    #[test]
    fn prop_missing_argument_is_an_error(extra in 1usize..4) {
        let text = vec!["x = ?"; extra + 1].join(" OR ");
        let part_args: Vec<Arg> = (0..extra as i64).map(Arg::from).collect();
        prop_assert!(q(text, part_args).to_sql().is_err());
    }

    /// Property: the parser returns an error instead of panicking on arbitrary text
    #[test]
    fn prop_parser_never_panics(input in "\\PC{0,64}") {
        let _ = cel::parse(&input);
    }

    /// Property: escaped LIKE patterns contain no bare wildcards
    #[test]
    fn prop_like_pattern_escapes(input in "[a-zA-Z0-9%_\\\\]{1,24}") {
        let pattern = compile::like_pattern(&input);
        let inner = &pattern[1..pattern.len() - 1];
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                let escaped = chars.next();
                prop_assert!(matches!(escaped, Some('%') | Some('_') | Some('\\')));
            } else {
                prop_assert!(c != '%' && c != '_');
            }
        }
    }
}
