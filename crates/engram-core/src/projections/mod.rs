//! Derived views built from core entities.
//!
//! Projectors never own data of their own: the profile is a fold over
//! enrichment observations and explicit PUTs, the portfolio is a fold over
//! the transaction ledger, and narratives are synthesized from retrieval
//! windows.

mod narrative;
mod portfolio;
mod profile;

pub use narrative::{Chapter, Narrative, NarrativeBuilder, NarrativeRequest};
pub use portfolio::{PortfolioProjector, PortfolioSummary};
pub use profile::{
    category_fields, total_registry_fields, ProfileCompleteness, ProfileFieldView,
    ProfileObservation, ProfileProjector, ProfileView, PROFILE_CATEGORIES,
};
