//! Area selection from `--areas` / `TILE_GENERATION_AREAS`.
//!
//! The selection is a comma-separated list. Built-in area names come from
//! the embedded registry. `test` and `all_test_areas` expand to every test
//! area registered in the key-value store; a `test_*` name selects one of
//! them.

use cleanup_map_geo::registry;
use cleanup_map_geo_models::AreaConfig;
use cleanup_map_r2::R2Error;
use cleanup_map_tracker::{ChangeTracker, TrackerError};

/// Configuration problems detected before any publish starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },

    /// A requested area does not exist.
    #[error("Unknown area '{name}'. Available: {available}")]
    UnknownArea {
        /// The requested name.
        name: String,
        /// Comma-separated known names.
        available: String,
    },

    /// The selection named no areas.
    #[error("No areas selected")]
    NoAreas,

    /// Test areas could not be loaded.
    #[error("Failed to load test areas: {0}")]
    TestAreas(#[source] TrackerError),

    /// Object store client setup failed.
    #[error(transparent)]
    Store(R2Error),
}

impl From<R2Error> for ConfigError {
    fn from(e: R2Error) -> Self {
        match e {
            R2Error::MissingEnv { name } => Self::MissingEnv { name },
            other => Self::Store(other),
        }
    }
}

impl From<TrackerError> for ConfigError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::MissingEnv { name } => Self::MissingEnv { name },
            other => Self::TestAreas(other),
        }
    }
}

/// One entry of the selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AreaToken {
    /// A built-in area.
    Named(String),
    /// A single remote test area.
    Test(String),
    /// Every remote test area.
    AllTest,
}

impl AreaToken {
    fn parse(raw: &str) -> Self {
        match raw {
            "test" | "all_test_areas" => Self::AllTest,
            name if name.starts_with("test_") => Self::Test(name.to_string()),
            name => Self::Named(name.to_string()),
        }
    }

    const fn is_remote(&self) -> bool {
        matches!(self, Self::Test(_) | Self::AllTest)
    }
}

/// Splits a selection string into tokens. Blank entries are ignored.
#[must_use]
pub fn parse_selection(raw: &str) -> Vec<AreaToken> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(AreaToken::parse)
        .collect()
}

/// Returns `true` if resolving `tokens` needs the remote test areas.
#[must_use]
pub fn needs_remote(tokens: &[AreaToken]) -> bool {
    tokens.iter().any(AreaToken::is_remote)
}

/// Resolves tokens against the built-in registry and the given remote
/// test areas, keeping the first occurrence of each name.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownArea`] for a built-in name that does not
/// exist and [`ConfigError::NoAreas`] if nothing was selected. A missing
/// `test_*` area is only logged, since test areas come and go.
pub fn resolve_selection(
    tokens: &[AreaToken],
    remote: &[AreaConfig],
) -> Result<Vec<AreaConfig>, ConfigError> {
    let builtin = registry::all_areas();
    let mut selected: Vec<AreaConfig> = Vec::new();
    let mut push = |area: &AreaConfig| {
        if !selected.iter().any(|a| a.name == area.name) {
            selected.push(area.clone());
        }
    };

    for token in tokens {
        match token {
            AreaToken::Named(name) => {
                let area = builtin.iter().find(|a| &a.name == name).ok_or_else(|| {
                    ConfigError::UnknownArea {
                        name: name.clone(),
                        available: builtin
                            .iter()
                            .map(|a| a.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    }
                })?;
                push(area);
            }
            AreaToken::Test(name) => match remote.iter().find(|a| &a.name == name) {
                Some(area) => push(area),
                None => log::warn!("Test area {name} is not registered, skipping"),
            },
            AreaToken::AllTest => remote.iter().for_each(&mut push),
        }
    }

    if selected.is_empty() {
        return Err(ConfigError::NoAreas);
    }
    Ok(selected)
}

/// Parses `raw` and resolves it, loading remote test areas only when a
/// token asks for them.
///
/// # Errors
///
/// Returns [`ConfigError`] if the selection is invalid or the test areas
/// cannot be loaded.
pub async fn select_areas(
    raw: &str,
    tracker: &ChangeTracker,
) -> Result<Vec<AreaConfig>, ConfigError> {
    let tokens = parse_selection(raw);
    let remote = if needs_remote(&tokens) {
        tracker.fetch_remote_areas().await?
    } else {
        Vec::new()
    };

    let areas = resolve_selection(&tokens, &remote)?;
    log::info!(
        "Selected area(s): {}",
        areas
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(areas)
}
