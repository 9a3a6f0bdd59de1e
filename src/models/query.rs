use std::fmt;

/// A literal lifted out of a request clause and bound as a statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlParam::Int(v) => write!(f, "{}", v),
            SqlParam::Float(v) => write!(f, "{}", v),
            SqlParam::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

/// How a driver spells positional parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
    /// `?` (MySQL)
    Question,
    /// `?1`, `?2`, ... (SQLite)
    NumberedQuestion,
}

impl PlaceholderStyle {
    /// Render the placeholder for the 1-based parameter `index`
    pub fn render(&self, index: usize) -> String {
        match self {
            PlaceholderStyle::Dollar => format!("${}", index),
            PlaceholderStyle::Question => "?".to_string(),
            PlaceholderStyle::NumberedQuestion => format!("?{}", index),
        }
    }
}

/// A single SELECT statement ready for execution
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl ComposedQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

impl fmt::Display for ComposedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            return write!(f, "{}", self.sql);
        }
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        write!(f, "{} -- params: [{}]", self.sql, params.join(", "))
    }
}
