use serde::{Deserialize, Serialize};

/// Sector assigned to instruments created implicitly by an import.
pub const PLACEHOLDER_SECTOR: &str = "Unclassified";

/// Exchange assigned to instruments created implicitly by an import.
pub const PLACEHOLDER_EXCHANGE: &str = "UNLISTED";

/// An instrument known to the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: i64,
    pub symbol: String,
    pub name: String,
    pub sector: String,
    pub exchange: String,
    /// True when the instrument was created as a placeholder by an import.
    pub placeholder: bool,
}
