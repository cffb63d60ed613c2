//! Data Source Adapters
//!
//! One module per external provider, all implementing `EnrichmentSource`.

pub mod clearbit;
pub mod free_company_data;
pub mod free_geocoding;
pub mod google_places;
pub mod groq_ai;
pub mod ip_api;
pub mod metadata;
pub mod openai_gpt;
pub mod proxycurl;
pub mod receita;

pub use clearbit::ClearbitSource;
pub use free_company_data::FreeCompanyDataSource;
pub use free_geocoding::FreeGeocodingSource;
pub use google_places::GooglePlacesSource;
pub use groq_ai::GroqAiSource;
pub use ip_api::IpApiSource;
pub use metadata::{EnhancedMetadataSource, MetadataSource};
pub use openai_gpt::OpenAiGptSource;
pub use proxycurl::ProxycurlSource;
pub use receita::ReceitaSource;
