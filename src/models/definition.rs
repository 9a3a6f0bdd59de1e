use serde::{Deserialize, Serialize};
use std::fmt;

/// A named backend database, as declared in the configuration file
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseDefinition {
    pub name: String,
    pub url: String,
    pub driver: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl DatabaseDefinition {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        driver: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            driver: driver.into(),
            username: String::new(),
            password: String::new(),
        }
    }

    #[cfg(test)]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }
}

impl fmt::Debug for DatabaseDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseDefinition")
            .field("name", &self.name)
            .field("url", &crate::services::database::mask_credentials(&self.url))
            .field("driver", &self.driver)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Contents of the database configuration file
///
/// ```json
/// {
///   "databases": [
///     { "name": "roster", "url": "jdbc:postgresql://db/roster", "driver": "org.postgresql.Driver",
///       "username": "reader", "password": "secret" }
///   ],
///   "reloadFilePath": "reload.txt"
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MusterConfiguration {
    #[serde(default)]
    pub databases: Vec<DatabaseDefinition>,
    #[serde(default)]
    pub reload_file_path: Option<String>,
}
