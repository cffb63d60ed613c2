//! Website Metadata Scrapers
//!
//! Free adapters that fetch the company homepage and extract title, Open
//! Graph tags, JSON-LD structured data, detected technologies, social
//! links and a logo. The enhanced variant adds WhatsApp/phone/email
//! extraction on top.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;

use super::super::source::{EnrichContext, EnrichError, EnrichmentSource, SourceData, SourceTier};
use crate::services::http_call::RetryingClient;

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"));

static META_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)<meta\s+(?:property|name)=["']([^"']+)["']\s+content=["']([^"']*)["']"#,
    )
    .expect("meta regex")
});

static JSON_LD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<script[^>]*type=["']application/ld\+json["'][^>]*>(.*?)</script>"#)
        .expect("json-ld regex")
});

static LOGO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<link[^>]*rel=["'](?:shortcut )?icon["'][^>]*href=["']([^"']+)["']"#)
        .expect("logo regex")
});

/// Technology fingerprints scanned against the raw HTML.
static TECH_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("React", r"(?i)react(?:\.production|\.development|-dom)"),
        ("Next.js", r"(?i)_next/static|__next_data__"),
        ("Vue.js", r"(?i)vue(?:\.runtime|\.min)?\.js"),
        ("Angular", r"(?i)ng-version="),
        ("WordPress", r"(?i)wp-content|wp-includes"),
        ("Shopify", r"(?i)cdn\.shopify\.com"),
        ("Tailwind", r"(?i)tailwindcss|tw-"),
        ("GraphQL", r"(?i)graphql"),
        ("Node.js", r"(?i)node_modules"),
        ("Google Analytics", r"(?i)gtag\(|google-analytics\.com"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("tech regex")))
    .collect()
});

/// Social platform URL patterns.
static SOCIAL_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("instagram", r"(?i)instagram\.com/([A-Za-z0-9_.]+)"),
        ("facebook", r"(?i)facebook\.com/([A-Za-z0-9_.\-]+)"),
        ("linkedin", r"(?i)linkedin\.com/company/([A-Za-z0-9_\-]+)"),
        ("twitter", r"(?i)(?:twitter|x)\.com/([A-Za-z0-9_]+)"),
        ("youtube", r"(?i)youtube\.com/(?:c/|channel/|@)([A-Za-z0-9_\-]+)"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("social regex")))
    .collect()
});

static WHATSAPP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:wa\.me|api\.whatsapp\.com/send\?phone=)/?(\+?\d{10,15})")
        .expect("whatsapp regex")
});

static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    // Brazilian formats: (11) 99999-9999, +55 11 9999-9999
    Regex::new(r"(?:\+55\s?)?\(?\d{2}\)?\s?9?\d{4}[-\s]?\d{4}").expect("phone regex")
});

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email regex")
});

// ============================================================================
// Basic Metadata Source
// ============================================================================

pub struct MetadataSource {
    client: RetryingClient,
}

impl MetadataSource {
    pub fn new(client: RetryingClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EnrichmentSource for MetadataSource {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Free
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &["company_name", "description", "website_tech", "social_media", "logo_url"]
    }

    async fn enrich(&self, domain: &str, _ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let html = fetch_homepage(&self.client, domain).await?;
        Ok(extract_basic_metadata(&html))
    }
}

// ============================================================================
// Enhanced Metadata Source
// ============================================================================

/// Adds contact extraction and JSON-LD organization parsing on top of the
/// basic scraper.
pub struct EnhancedMetadataSource {
    client: RetryingClient,
}

impl EnhancedMetadataSource {
    pub fn new(client: RetryingClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EnrichmentSource for EnhancedMetadataSource {
    fn name(&self) -> &'static str {
        "metadata_enhanced"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Free
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn provided_fields(&self) -> &'static [&'static str] {
        &[
            "company_name",
            "description",
            "website_tech",
            "social_media",
            "logo_url",
            "phone",
            "whatsapp",
            "email",
            "city",
            "state",
            "country",
        ]
    }

    async fn enrich(&self, domain: &str, _ctx: &EnrichContext) -> Result<SourceData, EnrichError> {
        let html = fetch_homepage(&self.client, domain).await?;
        let mut data = extract_basic_metadata(&html);

        if let Some(m) = WHATSAPP_RE.captures(&html) {
            data.insert("whatsapp".to_string(), Value::String(m[1].to_string()));
        }
        if let Some(m) = PHONE_RE.find(&html) {
            data.insert("phone".to_string(), Value::String(m.as_str().trim().to_string()));
        }
        if let Some(m) = EMAIL_RE.find(&html) {
            let email = m.as_str();
            // Asset filenames match the email regex surprisingly often.
            if !email.ends_with(".png") && !email.ends_with(".jpg") && !email.ends_with(".svg") {
                data.insert("email".to_string(), Value::String(email.to_string()));
            }
        }

        merge_structured_data(&html, &mut data);

        Ok(data)
    }
}

// ============================================================================
// Shared Extraction Helpers
// ============================================================================

async fn fetch_homepage(client: &RetryingClient, domain: &str) -> Result<String, EnrichError> {
    let url = format!("https://{}", domain);
    let headers = [("User-Agent", "Mozilla/5.0 (compatible; BussolaBot/1.0)".to_string())];
    let html = client
        .get_text(&url, &headers, Duration::from_secs(8))
        .await?;

    if html.trim().is_empty() {
        return Err(EnrichError::InvalidResponse("empty homepage".to_string()));
    }
    Ok(html)
}

fn extract_basic_metadata(html: &str) -> SourceData {
    let mut data = SourceData::new();

    let mut og_title = None;
    let mut og_description = None;
    let mut og_image = None;

    for cap in META_RE.captures_iter(html) {
        let name = cap[1].to_lowercase();
        let content = cap[2].trim().to_string();
        if content.is_empty() {
            continue;
        }
        match name.as_str() {
            "og:title" => og_title = Some(content),
            "og:description" | "description" => {
                og_description.get_or_insert(content);
            },
            "og:image" => og_image = Some(content),
            _ => {},
        }
    }

    let title = og_title.or_else(|| {
        TITLE_RE
            .captures(html)
            .map(|c| c[1].split(['|', '-']).next().unwrap_or(&c[1]).trim().to_string())
    });
    if let Some(title) = title
        && !title.is_empty()
    {
        data.insert("company_name".to_string(), Value::String(title));
    }

    if let Some(description) = og_description {
        data.insert("description".to_string(), Value::String(description));
    }

    let tech = detect_technologies(html);
    if !tech.is_empty() {
        data.insert(
            "website_tech".to_string(),
            Value::Array(tech.into_iter().map(Value::String).collect()),
        );
    }

    let social = detect_social_media(html);
    if !social.is_empty() {
        data.insert("social_media".to_string(), Value::Object(social));
    }

    let logo = og_image.or_else(|| LOGO_RE.captures(html).map(|c| c[1].to_string()));
    if let Some(logo) = logo {
        data.insert("logo_url".to_string(), Value::String(logo));
    }

    data
}

fn detect_technologies(html: &str) -> Vec<String> {
    TECH_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(html))
        .map(|(name, _)| name.to_string())
        .collect()
}

fn detect_social_media(html: &str) -> serde_json::Map<String, Value> {
    let mut social = serde_json::Map::new();
    for (platform, re) in SOCIAL_PATTERNS.iter() {
        if let Some(cap) = re.captures(html) {
            let handle = cap[1].trim_end_matches('/');
            social.insert(platform.to_string(), Value::String(handle.to_string()));
        }
    }
    social
}

/// Parse JSON-LD blocks and merge Organization fields we trust.
fn merge_structured_data(html: &str, data: &mut SourceData) {
    for cap in JSON_LD_RE.captures_iter(html) {
        let Ok(parsed) = serde_json::from_str::<Value>(cap[1].trim()) else {
            continue;
        };

        let ld_type = parsed["@type"].as_str().unwrap_or_default();
        if !matches!(ld_type, "Organization" | "LocalBusiness" | "Corporation") {
            continue;
        }

        if let Some(name) = parsed["name"].as_str() {
            data.insert("company_name".to_string(), Value::String(name.to_string()));
        }
        if let Some(logo) = parsed["logo"].as_str() {
            data.insert("logo_url".to_string(), Value::String(logo.to_string()));
        }
        if let Some(phone) = parsed["telephone"].as_str() {
            data.insert("phone".to_string(), Value::String(phone.to_string()));
        }
        if let Some(address) = parsed.get("address") {
            if let Some(city) = address["addressLocality"].as_str() {
                data.insert("city".to_string(), Value::String(city.to_string()));
            }
            if let Some(state) = address["addressRegion"].as_str() {
                data.insert("state".to_string(), Value::String(state.to_string()));
            }
            if let Some(country) = address["addressCountry"].as_str() {
                data.insert("country".to_string(), Value::String(country.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_HTML: &str = r#"
    <html><head>
    <title>TechStart - Pagamentos Digitais</title>
    <meta property="og:title" content="TechStart">
    <meta name="description" content="Plataforma de pagamentos para PMEs.">
    <meta property="og:image" content="https://techstart.com.br/logo.png">
    <script type="application/ld+json">
    {"@type": "Organization", "name": "TechStart Tecnologia",
     "telephone": "+55 11 4002-8922",
     "address": {"addressLocality": "São Paulo", "addressRegion": "SP", "addressCountry": "BR"}}
    </script>
    <script src="/_next/static/chunks/main.js"></script>
    </head><body>
    <a href="https://instagram.com/techstartbr">Instagram</a>
    <a href="https://wa.me/5511999998888">WhatsApp</a>
    <footer>contato@techstart.com.br (11) 99999-8888</footer>
    </body></html>
    "#;

    #[test]
    fn test_basic_extraction() {
        let data = extract_basic_metadata(SAMPLE_HTML);
        assert_eq!(data["company_name"], "TechStart");
        assert_eq!(data["description"], "Plataforma de pagamentos para PMEs.");
        assert_eq!(data["logo_url"], "https://techstart.com.br/logo.png");

        let tech: Vec<&str> = data["website_tech"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(tech.contains(&"Next.js"));

        assert_eq!(data["social_media"]["instagram"], "techstartbr");
    }

    #[test]
    fn test_structured_data_overrides_title() {
        let mut data = extract_basic_metadata(SAMPLE_HTML);
        merge_structured_data(SAMPLE_HTML, &mut data);
        assert_eq!(data["company_name"], "TechStart Tecnologia");
        assert_eq!(data["city"], "São Paulo");
        assert_eq!(data["state"], "SP");
        assert_eq!(data["phone"], "+55 11 4002-8922");
    }

    #[test]
    fn test_contact_patterns() {
        assert!(WHATSAPP_RE.captures(SAMPLE_HTML).is_some());
        assert!(PHONE_RE.find("(11) 99999-8888").is_some());
        assert_eq!(
            EMAIL_RE.find("fale com contato@techstart.com.br hoje").unwrap().as_str(),
            "contato@techstart.com.br"
        );
    }

    #[test]
    fn test_title_fallback_strips_separator() {
        let html = "<html><head><title>Acme | Home</title></head><body></body></html>";
        let data = extract_basic_metadata(html);
        assert_eq!(data["company_name"], "Acme");
    }
}
