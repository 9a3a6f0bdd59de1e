use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::api::middleware::AppError;

/// SQL validation service for ensuring composed statements are a single SELECT
pub struct SqlValidator;

impl SqlValidator {
    /// Validate SQL query and ensure it's exactly one SELECT statement
    pub fn validate_select_only(sql: &str) -> Result<(), AppError> {
        let dialect = GenericDialect {};
        let ast = Parser::new(&dialect)
            .try_with_sql(sql)
            .and_then(|mut parser| parser.parse_statements())
            .map_err(|e| AppError::InvalidQuery(format!("SQL parsing error: {}", e)))?;

        match ast.as_slice() {
            [] => Err(AppError::InvalidQuery("Empty SQL query".to_string())),
            [Statement::Query(_)] => Ok(()),
            [_] => Err(AppError::InvalidQuery(
                "Only SELECT queries are permitted".to_string(),
            )),
            _ => Err(AppError::InvalidQuery(format!(
                "Expected a single statement, found {}",
                ast.len()
            ))),
        }
    }
}
