//! Database kinds recognized from mapping URLs.

use serde::{Deserialize, Serialize};

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Detect the database type from a mapping URL. A leading `jdbc:` is ignored.
    pub fn from_mapping_name(mapping_name: &str) -> Option<Self> {
        let lower = mapping_name.trim().to_lowercase();
        let lower = lower.strip_prefix("jdbc:").unwrap_or(&lower);
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Driver name used in diagnostics when none is configured.
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_mapping_name() {
        assert_eq!(
            DatabaseType::from_mapping_name("postgres://u:p@localhost/db"),
            Some(DatabaseType::PostgreSQL)
        );
        assert_eq!(
            DatabaseType::from_mapping_name("jdbc:mysql://localhost/db"),
            Some(DatabaseType::MySQL)
        );
        assert_eq!(
            DatabaseType::from_mapping_name("sqlite::memory:"),
            Some(DatabaseType::SQLite)
        );
        assert_eq!(
            DatabaseType::from_mapping_name("jdbc:oracle:thin:@localhost:1521:ORCL"),
            None
        );
    }
}
