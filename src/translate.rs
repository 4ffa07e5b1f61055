//! Shorthand query translator.
//!
//! Classifies a query string against a fixed grammar (first match wins,
//! prefixes case-insensitive) and compiles it into a parameterized SQL
//! statement over the current aggregate snapshot.
//!
//! | Input | Predicate |
//! |-------|-----------|
//! | `title: <text>` | title contains text |
//! | `email: <text>` / `emails: <text>` | emails contain text |
//! | `filter: <tok>... [<op><n>]` | 1st token in emails, 2nd in tech names, rest in either; comparators on population |
//! | `crm: a` / `crm: b` / `crm: all` | customer external id present |
//! | `range: <field> <op><n>` | numeric comparison on population, lat or long |
//! | `<column>: <text>` | substring match on a known text column |
//! | anything else | full-text match on the search document |
//!
//! Column names only ever come from [`TextField`] and [`NumericField`];
//! user text is always a bound parameter.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::error::QuerySyntaxError;

static PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z_]+)\s*:(.*)$").expect("valid prefix regex"));

static BARE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w@.\-+]+$").expect("valid bare word regex"));

/// Text columns of the aggregate view that accept substring matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Emails,
    Title,
    DisplayName,
    TechNames,
    CustomerAId,
    CustomerBId,
}

impl TextField {
    pub const ALL: [TextField; 6] = [
        TextField::Emails,
        TextField::Title,
        TextField::DisplayName,
        TextField::TechNames,
        TextField::CustomerAId,
        TextField::CustomerBId,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            TextField::Emails => "emails",
            TextField::Title => "title",
            TextField::DisplayName => "display_name",
            TextField::TechNames => "tech_names",
            TextField::CustomerAId => "customer_a_id",
            TextField::CustomerBId => "customer_b_id",
        }
    }

    pub fn from_column(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.column() == name)
    }
}

/// Numeric columns usable in comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericField {
    Population,
    Lat,
    Long,
}

impl NumericField {
    pub fn column(&self) -> &'static str {
        match self {
            NumericField::Population => "population",
            NumericField::Lat => "lat",
            NumericField::Long => "long",
        }
    }

    pub fn from_column(name: &str) -> Option<Self> {
        match name {
            "population" | "pop" => Some(NumericField::Population),
            "lat" | "latitude" => Some(NumericField::Lat),
            "long" | "lng" | "longitude" => Some(NumericField::Long),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl Comparator {
    pub fn sql(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
            Comparator::Eq => "=",
        }
    }

    /// Split a leading comparator off `token`, longest operator first.
    fn split(token: &str) -> Option<(Comparator, &str)> {
        for (op, cmp) in [
            (">=", Comparator::Ge),
            ("<=", Comparator::Le),
            (">", Comparator::Gt),
            ("<", Comparator::Lt),
            ("=", Comparator::Eq),
        ] {
            if let Some(rest) = token.strip_prefix(op) {
                return Some((cmp, rest));
            }
        }
        None
    }
}

/// A filter over aggregate records.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Case-insensitive substring match. The needle is stored lower-cased.
    Contains(TextField, String),
    Compare(NumericField, Comparator, f64),
    NotNull(TextField),
    /// Every word must appear in the search document.
    FullText(Vec<String>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Predicate {
    fn contains(field: TextField, text: &str) -> Self {
        Predicate::Contains(field, text.to_lowercase())
    }
}

/// Grammar rules in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Title,
    Email,
    Filter,
    Crm,
    Range,
    Column(TextField),
    FullText,
}

/// Pick the rule for `input`, returning it with the text after the prefix.
pub fn classify(input: &str) -> (Rule, &str) {
    let Some(caps) = PREFIX.captures(input) else {
        return (Rule::FullText, input);
    };
    let (Some(prefix), Some(rest)) = (caps.get(1), caps.get(2)) else {
        return (Rule::FullText, input);
    };

    let rule = match prefix.as_str().to_ascii_lowercase().as_str() {
        "title" => Rule::Title,
        "email" | "emails" => Rule::Email,
        "filter" => Rule::Filter,
        "crm" => Rule::Crm,
        "range" => Rule::Range,
        other => match TextField::from_column(other) {
            Some(field) => Rule::Column(field),
            None => return (Rule::FullText, input),
        },
    };
    (rule, rest.as_str().trim())
}

/// Parse a shorthand query into a predicate tree.
pub fn parse(input: &str) -> Result<Predicate, QuerySyntaxError> {
    let (rule, rest) = classify(input);
    match rule {
        Rule::Title => Ok(Predicate::contains(TextField::Title, required(rest, "title:")?)),
        Rule::Email => Ok(Predicate::contains(TextField::Emails, required(rest, "email:")?)),
        Rule::Column(field) => {
            let prefix = format!("{}:", field.column());
            Ok(Predicate::contains(field, required(rest, &prefix)?))
        }
        Rule::Filter => parse_filter(rest),
        Rule::Crm => parse_crm(rest),
        Rule::Range => parse_range(rest),
        Rule::FullText => Ok(Predicate::FullText(fulltext_words(rest))),
    }
}

fn required<'a>(text: &'a str, prefix: &str) -> Result<&'a str, QuerySyntaxError> {
    if text.is_empty() {
        Err(QuerySyntaxError::new(prefix, "expected text after the prefix"))
    } else {
        Ok(text)
    }
}

fn parse_filter(rest: &str) -> Result<Predicate, QuerySyntaxError> {
    let mut words: Vec<&str> = Vec::new();
    let mut conjuncts: Vec<Predicate> = Vec::new();

    for token in rest.split_whitespace() {
        if let Some((cmp, operand)) = Comparator::split(token) {
            let n = parse_number(token, operand)?;
            conjuncts.push(Predicate::Compare(NumericField::Population, cmp, n));
        } else if BARE_WORD.is_match(token) {
            words.push(token);
        }
    }

    let mut terms: Vec<Predicate> = Vec::with_capacity(words.len() + conjuncts.len());
    for (i, word) in words.iter().enumerate() {
        terms.push(match i {
            0 => Predicate::contains(TextField::Emails, word),
            1 => Predicate::contains(TextField::TechNames, word),
            _ => Predicate::Any(vec![
                Predicate::contains(TextField::Emails, word),
                Predicate::contains(TextField::TechNames, word),
            ]),
        });
    }
    terms.extend(conjuncts);

    if terms.is_empty() {
        return Err(QuerySyntaxError::new(
            "filter:",
            "expected at least one word or comparison",
        ));
    }
    Ok(Predicate::All(terms))
}

fn parse_number(token: &str, operand: &str) -> Result<f64, QuerySyntaxError> {
    if operand.is_empty() {
        return Err(QuerySyntaxError::new(token, "comparison is missing a number"));
    }
    operand
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| QuerySyntaxError::new(token, "comparison operand is not a number"))
}

fn parse_crm(rest: &str) -> Result<Predicate, QuerySyntaxError> {
    match rest.to_ascii_lowercase().as_str() {
        "a" => Ok(Predicate::NotNull(TextField::CustomerAId)),
        "b" => Ok(Predicate::NotNull(TextField::CustomerBId)),
        "all" => Ok(Predicate::Any(vec![
            Predicate::NotNull(TextField::CustomerAId),
            Predicate::NotNull(TextField::CustomerBId),
        ])),
        "" => Err(QuerySyntaxError::new("crm:", "expected a, b or all")),
        _ => Err(QuerySyntaxError::new(rest, "unknown customer, expected a, b or all")),
    }
}

fn parse_range(rest: &str) -> Result<Predicate, QuerySyntaxError> {
    let mut parts = rest.split_whitespace();
    let Some(name) = parts.next() else {
        return Err(QuerySyntaxError::new("range:", "expected a field and a comparison"));
    };
    let field = NumericField::from_column(&name.to_ascii_lowercase())
        .ok_or_else(|| QuerySyntaxError::new(name, "unknown numeric field"))?;

    let comparison: String = parts.collect();
    let Some((cmp, operand)) = Comparator::split(&comparison) else {
        let token = if comparison.is_empty() { name } else { comparison.as_str() };
        return Err(QuerySyntaxError::new(token, "expected a comparison such as >1000"));
    };
    let n = parse_number(&comparison, operand)?;
    Ok(Predicate::Compare(field, cmp, n))
}

/// Words of a plain-text query. Words without any letter or digit are
/// dropped since the index never matches them.
pub fn fulltext_words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .map(str::to_lowercase)
        .collect()
}

/// FTS5 query text: each word quoted as a phrase, implicitly ANDed.
pub fn fts_match_expr(words: &[String]) -> String {
    words
        .iter()
        .map(|w| format!("\"{}\"", w.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    Real(f64),
    Integer(i64),
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Text(s) => write!(f, "'{}'", s),
            Param::Real(n) => write!(f, "{}", n),
            Param::Integer(n) => write!(f, "{}", n),
        }
    }
}

/// Parameterized SQL ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Param>,
}

impl CompiledQuery {
    /// The SQL followed by its parameters, for `--explain` and the shell.
    pub fn explain(&self) -> String {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        format!("{}\n-- params: [{}]", self.sql, params.join(", "))
    }
}

const CURRENT_VERSION: &str = "(SELECT version FROM aggregate_current WHERE id = 1)";

/// Compile a predicate into a query over the current snapshot.
pub fn compile(predicate: &Predicate, limit: i64) -> CompiledQuery {
    let mut params = Vec::new();
    let condition = compile_predicate(predicate, &mut params);
    params.push(Param::Integer(limit));

    let sql = format!(
        "SELECT r.contact_id, r.emails, r.title, r.display_name, r.population, r.lat, r.long, \
         r.tech_names, r.customer_a_id, r.customer_b_id\n\
         FROM aggregate_records r\n\
         WHERE r.version = {}\n  AND {}\n\
         ORDER BY r.contact_id\n\
         LIMIT ?",
        CURRENT_VERSION, condition
    );
    CompiledQuery { sql, params }
}

fn compile_predicate(predicate: &Predicate, params: &mut Vec<Param>) -> String {
    match predicate {
        Predicate::Contains(field, needle) => {
            params.push(Param::Text(needle.clone()));
            format!("instr(lower(r.{}), ?) > 0", field.column())
        }
        Predicate::Compare(field, cmp, n) => {
            params.push(Param::Real(*n));
            format!("r.{} {} ?", field.column(), cmp.sql())
        }
        Predicate::NotNull(field) => format!("r.{} IS NOT NULL", field.column()),
        Predicate::FullText(words) if words.is_empty() => "1 = 0".to_string(),
        Predicate::FullText(words) => {
            params.push(Param::Text(fts_match_expr(words)));
            format!(
                "r.contact_id IN (SELECT contact_id FROM aggregate_fts \
                 WHERE aggregate_fts MATCH ? AND version = {})",
                CURRENT_VERSION
            )
        }
        Predicate::All(parts) => join(parts, " AND ", "1 = 1", params),
        Predicate::Any(parts) => join(parts, " OR ", "1 = 0", params),
    }
}

fn join(parts: &[Predicate], sep: &str, empty: &str, params: &mut Vec<Param>) -> String {
    match parts {
        [] => empty.to_string(),
        [only] => compile_predicate(only, params),
        _ => {
            let compiled: Vec<String> = parts
                .iter()
                .map(|p| compile_predicate(p, params))
                .collect();
            format!("({})", compiled.join(sep))
        }
    }
}

/// Parse and compile in one step.
pub fn translate(input: &str, limit: i64) -> Result<CompiledQuery, QuerySyntaxError> {
    parse(input).map(|p| compile(&p, limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_prefix_is_case_insensitive() {
        assert_eq!(
            parse("TITLE: Finance").unwrap(),
            Predicate::Contains(TextField::Title, "finance".to_string())
        );
        assert_eq!(
            parse("title:clerk").unwrap(),
            Predicate::Contains(TextField::Title, "clerk".to_string())
        );
    }

    #[test]
    fn email_and_alias() {
        let expected = Predicate::Contains(TextField::Emails, "bob@city.gov".to_string());
        assert_eq!(parse("email: bob@city.gov").unwrap(), expected);
        assert_eq!(parse("Emails: BOB@city.gov").unwrap(), expected);
    }

    #[test]
    fn empty_prefixed_text_is_an_error() {
        let err = parse("title:   ").unwrap_err();
        assert_eq!(err.token, "title:");
    }

    #[test]
    fn filter_assigns_words_by_position() {
        let p = parse("filter: bob accela >10000").unwrap();
        assert_eq!(
            p,
            Predicate::All(vec![
                Predicate::Contains(TextField::Emails, "bob".to_string()),
                Predicate::Contains(TextField::TechNames, "accela".to_string()),
                Predicate::Compare(NumericField::Population, Comparator::Gt, 10000.0),
            ])
        );
    }

    #[test]
    fn filter_extra_words_match_either_field() {
        let p = parse("filter: bob accela tyler").unwrap();
        let Predicate::All(terms) = p else {
            panic!("expected conjunction");
        };
        assert_eq!(
            terms[2],
            Predicate::Any(vec![
                Predicate::Contains(TextField::Emails, "tyler".to_string()),
                Predicate::Contains(TextField::TechNames, "tyler".to_string()),
            ])
        );
    }

    #[test]
    fn filter_comparators() {
        let p = parse("filter: >=500 <2,000 =7").unwrap();
        assert_eq!(
            p,
            Predicate::All(vec![
                Predicate::Compare(NumericField::Population, Comparator::Ge, 500.0),
                Predicate::Compare(NumericField::Population, Comparator::Lt, 2000.0),
                Predicate::Compare(NumericField::Population, Comparator::Eq, 7.0),
            ])
        );
    }

    #[test]
    fn filter_non_numeric_comparison_names_token() {
        let err = parse("filter: >abc").unwrap_err();
        assert_eq!(err.token, ">abc");
        let err = parse("filter: bob <=").unwrap_err();
        assert_eq!(err.token, "<=");
    }

    #[test]
    fn filter_ignores_unrecognized_tokens() {
        let p = parse("filter: bob (ignored) accela").unwrap();
        assert_eq!(
            p,
            Predicate::All(vec![
                Predicate::Contains(TextField::Emails, "bob".to_string()),
                Predicate::Contains(TextField::TechNames, "accela".to_string()),
            ])
        );
    }

    #[test]
    fn filter_without_terms_is_an_error() {
        assert!(parse("filter:").is_err());
        assert!(parse("filter: !!! ???").is_err());
    }

    #[test]
    fn crm_variants() {
        assert_eq!(parse("crm: a").unwrap(), Predicate::NotNull(TextField::CustomerAId));
        assert_eq!(parse("CRM: B").unwrap(), Predicate::NotNull(TextField::CustomerBId));
        assert!(matches!(parse("crm: all").unwrap(), Predicate::Any(v) if v.len() == 2));
        assert_eq!(parse("crm: c").unwrap_err().token, "c");
        assert_eq!(parse("crm:").unwrap_err().token, "crm:");
    }

    #[test]
    fn range_forms() {
        let expected = Predicate::Compare(NumericField::Lat, Comparator::Ge, 40.5);
        assert_eq!(parse("range: lat >=40.5").unwrap(), expected);
        assert_eq!(parse("range: latitude >= 40.5").unwrap(), expected);
        assert_eq!(parse("range: depth >1").unwrap_err().token, "depth");
        assert_eq!(parse("range: population big").unwrap_err().token, "big");
        assert_eq!(parse("range: population >x").unwrap_err().token, ">x");
    }

    #[test]
    fn known_column_prefix() {
        assert_eq!(
            parse("display_name: Springfield").unwrap(),
            Predicate::Contains(TextField::DisplayName, "springfield".to_string())
        );
        assert_eq!(
            parse("tech_names: accela").unwrap(),
            Predicate::Contains(TextField::TechNames, "accela".to_string())
        );
    }

    #[test]
    fn unknown_prefix_falls_through_to_fulltext() {
        assert_eq!(
            parse("mayor: smith").unwrap(),
            Predicate::FullText(vec!["mayor:".to_string(), "smith".to_string()])
        );
    }

    #[test]
    fn fulltext_words_and_match_expr() {
        let words = fulltext_words("Finance  \"director\" -- ");
        assert_eq!(words, vec!["finance", "\"director\""]);
        assert_eq!(fts_match_expr(&words), r#""finance" """director""""#);
        assert!(fulltext_words("  ").is_empty());
    }

    #[test]
    fn compile_binds_user_text() {
        let q = translate("title: x'); DROP TABLE contacts; --", 50).unwrap();
        assert!(!q.sql.contains("DROP"));
        assert_eq!(
            q.params,
            vec![
                Param::Text("x'); drop table contacts; --".to_string()),
                Param::Integer(50)
            ]
        );
        assert!(q.sql.contains("instr(lower(r.title), ?) > 0"));
        assert!(q.sql.contains("ORDER BY r.contact_id"));
    }

    #[test]
    fn compile_filter_param_order() {
        let q = translate("filter: bob accela >10000", 10).unwrap();
        assert!(q.sql.contains(
            "(instr(lower(r.emails), ?) > 0 AND instr(lower(r.tech_names), ?) > 0 AND r.population > ?)"
        ));
        assert_eq!(
            q.params,
            vec![
                Param::Text("bob".to_string()),
                Param::Text("accela".to_string()),
                Param::Real(10000.0),
                Param::Integer(10),
            ]
        );
    }

    #[test]
    fn compile_empty_fulltext_matches_nothing() {
        let q = translate("  ", 10).unwrap();
        assert!(q.sql.contains("AND 1 = 0"));
        assert_eq!(q.params, vec![Param::Integer(10)]);
    }

    #[test]
    fn compile_fulltext_uses_index() {
        let q = translate("finance director", 10).unwrap();
        assert!(q.sql.contains("aggregate_fts MATCH ?"));
        assert_eq!(q.params[0], Param::Text("\"finance\" \"director\"".to_string()));
    }

    #[test]
    fn explain_lists_params() {
        let q = translate("crm: a", 5).unwrap();
        let text = q.explain();
        assert!(text.contains("r.customer_a_id IS NOT NULL"));
        assert!(text.ends_with("-- params: [5]"));
    }
}
