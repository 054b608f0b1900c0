//! # Enrichment
//!
//! Named lookup providers used by workflow `enrich`/`logic` steps. Every provider sits
//! behind the same async `resolve(params)` contract; the [`EnrichmentRegistry`] adds TTL
//! caching and single-flight de-duplication on top.
//!
//! Provider kinds:
//!
//! | type      | resolve                                                        |
//! |-----------|----------------------------------------------------------------|
//! | `list`    | O(1) lookup in a key → value map, optionally reloaded remotely |
//! | `httpGet` | templated GET, unused params as query string                   |
//! | `webhook` | templated call, query string or JSON body depending on method  |

pub mod providers;
pub mod registry;
pub mod template;
pub mod types;

pub use providers::{default_providers, ProviderDefinition};
pub use registry::{EnrichmentRegistry, GetOptions};
pub use types::{EnrichmentProvider, Params, ProviderError, ProviderInfo, ProviderResult};
