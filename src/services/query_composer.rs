// Builds the single SELECT statement a request asks for.
//
// `compose_legacy` is the historical string concatenation and is only reachable
// in legacy mode. `compose` accepts identifier lists for SELECT / FROM /
// ORDER BY and lifts every literal of the WHERE clause into a bound parameter.
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace, Word};

use crate::api::middleware::AppError;
use crate::models::{ComposedQuery, PlaceholderStyle, SqlParam};
use crate::validation::SqlValidator;

/// Words that may not appear unquoted in any clause
const DENIED_WORDS: &[&str] = &[
    "ALTER", "ATTACH", "BENCHMARK", "CALL", "COPY", "CREATE", "DELETE", "DROP", "EXCEPT",
    "EXEC", "EXECUTE", "GRANT", "INSERT", "INTERSECT", "INTO", "LOAD_FILE", "LO_IMPORT",
    "MERGE", "PG_READ_FILE", "PG_SLEEP", "PRAGMA", "REVOKE", "SELECT", "SET", "SLEEP",
    "TRUNCATE", "UNION", "UPDATE",
];

/// Functions a WHERE clause may call, plus the keywords that may precede a
/// parenthesized group
const CALLABLE_WORDS: &[&str] = &[
    "ABS", "AND", "BETWEEN", "CAST", "CHAR_LENGTH", "COALESCE", "IN", "LENGTH", "LIKE",
    "LOWER", "NOT", "NULLIF", "OR", "ROUND", "TRIM", "UPPER",
];

enum Segment {
    Sql(String),
    Param(SqlParam),
}

pub struct QueryComposer;

impl QueryComposer {
    /// `SELECT <select> FROM <from> [WHERE <where>] [ORDER BY <order>]`, verbatim.
    /// Performs no escaping at all.
    pub fn compose_legacy(
        select: &str,
        from: &str,
        where_clause: Option<&str>,
        order: Option<&str>,
    ) -> String {
        let mut sql = format!("SELECT {} FROM {}", select, from);
        if let Some(where_clause) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        if let Some(order) = order {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        sql
    }

    /// Validated statement with WHERE literals bound as parameters
    pub fn compose(
        select: &str,
        from: &str,
        where_clause: Option<&str>,
        order: Option<&str>,
        style: PlaceholderStyle,
    ) -> Result<ComposedQuery, AppError> {
        check_items("select", select, is_select_item)?;
        check_items("from", from, is_from_item)?;
        if let Some(order) = order {
            check_items("order", order, is_order_item)?;
        }
        let segments = match where_clause {
            Some(where_clause) => where_segments(where_clause)?,
            None => Vec::new(),
        };

        let render = |style: PlaceholderStyle| {
            let mut sql = format!("SELECT {} FROM {}", select.trim(), from.trim());
            let mut params = Vec::new();
            if !segments.is_empty() {
                sql.push_str(" WHERE ");
                for segment in &segments {
                    match segment {
                        Segment::Sql(text) => sql.push_str(text),
                        Segment::Param(param) => {
                            params.push(param.clone());
                            sql.push_str(&style.render(params.len()));
                        }
                    }
                }
            }
            if let Some(order) = order {
                sql.push_str(" ORDER BY ");
                sql.push_str(order.trim());
            }
            ComposedQuery::with_params(sql, params)
        };

        SqlValidator::validate_select_only(&render(PlaceholderStyle::Dollar).sql)?;
        Ok(render(style))
    }
}

fn invalid(clause: &str, message: impl std::fmt::Display) -> AppError {
    AppError::InvalidQuery(format!("{} clause: {}", clause, message))
}

fn tokenize(clause: &str, text: &str) -> Result<Vec<Token>, AppError> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, text)
        .tokenize()
        .map_err(|e| invalid(clause, e))?;

    for token in &tokens {
        match token {
            Token::Whitespace(Whitespace::SingleLineComment { .. })
            | Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                return Err(invalid(clause, "comments are not allowed"))
            }
            Token::SemiColon => return Err(invalid(clause, "`;` is not allowed")),
            Token::Placeholder(p) => {
                return Err(invalid(clause, format!("placeholder `{}` is not allowed", p)))
            }
            Token::Word(word) if is_denied(word) => {
                return Err(invalid(clause, format!("`{}` is not allowed", word.value)))
            }
            _ => {}
        }
    }
    Ok(tokens)
}

fn is_denied(word: &Word) -> bool {
    word.quote_style.is_none()
        && DENIED_WORDS
            .iter()
            .any(|denied| word.value.eq_ignore_ascii_case(denied))
}

fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
}

/// Split a comma-separated clause and check every item against `is_item`
fn check_items(clause: &str, text: &str, is_item: fn(&[Token]) -> bool) -> Result<(), AppError> {
    let significant: Vec<Token> = tokenize(clause, text)?
        .into_iter()
        .filter(|token| !matches!(token, Token::Whitespace(_) | Token::EOF))
        .collect();

    if significant.is_empty() {
        return Err(invalid(clause, "empty"));
    }

    for item in significant.split(|token| *token == Token::Comma) {
        if !is_item(item) {
            let rendered: Vec<String> = item.iter().map(|t| t.to_string()).collect();
            return Err(invalid(
                clause,
                format!("`{}` is not an allowed item", rendered.join(" ")),
            ));
        }
    }
    Ok(())
}

/// `name` or `qualifier.name`, optionally ending in `.*` when `allow_star`.
/// Returns the number of tokens consumed.
fn path_len(tokens: &[Token], allow_star: bool) -> Option<usize> {
    if !matches!(tokens.first(), Some(Token::Word(_))) {
        return None;
    }
    let mut len = 1;
    while matches!(tokens.get(len), Some(Token::Period)) {
        match tokens.get(len + 1) {
            Some(Token::Word(_)) => len += 2,
            Some(Token::Mul) if allow_star => return Some(len + 2),
            _ => return None,
        }
    }
    Some(len)
}

fn is_alias(tokens: &[Token]) -> bool {
    match tokens {
        [] => true,
        [Token::Word(_)] => true,
        [as_kw, Token::Word(_)] => is_keyword(as_kw, "AS"),
        _ => false,
    }
}

fn is_select_item(tokens: &[Token]) -> bool {
    if let [Token::Mul] = tokens {
        return true;
    }
    match path_len(tokens, true) {
        Some(len) if matches!(tokens[len - 1], Token::Mul) => len == tokens.len(),
        Some(len) => is_alias(&tokens[len..]),
        None => false,
    }
}

fn is_from_item(tokens: &[Token]) -> bool {
    match path_len(tokens, false) {
        Some(len) => is_alias(&tokens[len..]),
        None => false,
    }
}

fn is_order_item(tokens: &[Token]) -> bool {
    let len = match tokens.first() {
        Some(Token::Number(_, _)) => 1,
        _ => match path_len(tokens, false) {
            Some(len) => len,
            None => return false,
        },
    };

    let mut rest = &tokens[len..];
    if let Some(first) = rest.first() {
        if is_keyword(first, "ASC") || is_keyword(first, "DESC") {
            rest = &rest[1..];
        }
    }
    match rest {
        [] => true,
        [nulls, position] => {
            is_keyword(nulls, "NULLS")
                && (is_keyword(position, "FIRST") || is_keyword(position, "LAST"))
        }
        _ => false,
    }
}

fn where_segments(text: &str) -> Result<Vec<Segment>, AppError> {
    let tokens = tokenize("where", text)?;
    if tokens
        .iter()
        .all(|token| matches!(token, Token::Whitespace(_) | Token::EOF))
    {
        return Err(invalid("where", "empty"));
    }

    check_calls(&tokens)?;

    let mut segments = Vec::with_capacity(tokens.len());
    for token in tokens {
        let segment = match token {
            Token::EOF => continue,
            Token::Number(text, _) => Segment::Param(parse_number(&text)?),
            Token::SingleQuotedString(text) => Segment::Param(SqlParam::Text(text)),
            Token::Word(_)
            | Token::Whitespace(_)
            | Token::Eq
            | Token::DoubleEq
            | Token::Neq
            | Token::Lt
            | Token::Gt
            | Token::LtEq
            | Token::GtEq
            | Token::Plus
            | Token::Minus
            | Token::Mul
            | Token::Div
            | Token::Mod
            | Token::StringConcat
            | Token::LParen
            | Token::RParen
            | Token::Comma
            | Token::Period => Segment::Sql(token.to_string()),
            other => {
                return Err(invalid(
                    "where",
                    format!("`{}` is not allowed", other),
                ))
            }
        };
        segments.push(segment);
    }
    Ok(segments)
}

/// Only unqualified, unquoted calls to functions in [`CALLABLE_WORDS`] pass
fn check_calls(tokens: &[Token]) -> Result<(), AppError> {
    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|token| !matches!(token, Token::Whitespace(_) | Token::EOF))
        .collect();

    for (idx, window) in significant.windows(2).enumerate() {
        let word = match window {
            [Token::Word(word), Token::LParen] => word,
            _ => continue,
        };
        let qualified = idx > 0 && *significant[idx - 1] == Token::Period;
        let callable = word.quote_style.is_none()
            && !qualified
            && CALLABLE_WORDS
                .iter()
                .any(|allowed| word.value.eq_ignore_ascii_case(allowed));
        if !callable {
            return Err(invalid(
                "where",
                format!("function `{}` is not allowed", word.value),
            ));
        }
    }
    Ok(())
}

fn parse_number(text: &str) -> Result<SqlParam, AppError> {
    if let Ok(value) = text.parse::<i64>() {
        return Ok(SqlParam::Int(value));
    }
    // A float would silently match different rows
    if text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(
            "where",
            format!("integer `{}` is out of range", text),
        ));
    }
    text.parse::<f64>()
        .map(SqlParam::Float)
        .map_err(|_| invalid("where", format!("`{}` is not a number", text)))
}
