use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::CoursewareError;

pub const COMMERCE_API_NAME: &str = "commerce";
pub const COMMERCE_CACHE_KEY: &str = "commerce.api.data";
pub const DEFAULT_SINGLE_COURSE_CHECKOUT_PAGE: &str = "/basket/single-item/";
pub const DEFAULT_RECEIPT_PAGE_URL: &str = "/commerce/checkout/receipt/?orderNum=";
pub const MAX_CHECKOUT_PAGE_LEN: usize = 255;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SiteConfiguration {
    pub receipt_page: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Site {
    pub id: i64,
    pub domain: String,
    pub name: String,
    pub configuration: Option<SiteConfiguration>,
}

/// One version of the e-commerce integration settings. Each change is a new
/// row; the newest row is the live configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommerceConfiguration {
    pub id: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub change_date: Option<OffsetDateTime>,
    pub changed_by: Option<String>,
    pub enabled: bool,
    pub checkout_on_ecommerce_service: bool,
    pub single_course_checkout_page: String,
    pub cache_ttl: u32,
    pub site: Option<Site>,
}

impl Default for CommerceConfiguration {
    fn default() -> Self {
        Self {
            id: None,
            change_date: None,
            changed_by: None,
            enabled: false,
            checkout_on_ecommerce_service: false,
            single_course_checkout_page: DEFAULT_SINGLE_COURSE_CHECKOUT_PAGE.to_string(),
            cache_ttl: 0,
            site: None,
        }
    }
}

impl CommerceConfiguration {
    /// Absolute receipt page URL for the configured site, or the LMS-hosted
    /// receipt page when no site-level page is available.
    #[must_use]
    pub fn receipt_page_url(&self) -> String {
        if let Some(site) = &self.site {
            match site
                .configuration
                .as_ref()
                .and_then(|config| config.receipt_page.as_deref())
            {
                Some(receipt_page) => return format!("{}{receipt_page}", site.domain),
                None => info!(site = %site.domain, "site configuration is not enabled for site"),
            }
        }
        DEFAULT_RECEIPT_PAGE_URL.to_string()
    }

    /// Whether responses from the e-commerce API may be cached.
    #[must_use]
    pub fn is_cache_enabled(&self) -> bool {
        self.cache_ttl > 0
    }
}

/// Fields an operator supplies when recording a new configuration version.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommerceConfigurationInput {
    pub changed_by: Option<String>,
    pub enabled: bool,
    pub checkout_on_ecommerce_service: bool,
    pub single_course_checkout_page: String,
    pub cache_ttl: u32,
    pub site_id: Option<i64>,
}

impl CommerceConfigurationInput {
    /// Starts from the current configuration so unspecified fields carry over.
    #[must_use]
    pub fn from_current(current: &CommerceConfiguration) -> Self {
        Self {
            changed_by: None,
            enabled: current.enabled,
            checkout_on_ecommerce_service: current.checkout_on_ecommerce_service,
            single_course_checkout_page: current.single_course_checkout_page.clone(),
            cache_ttl: current.cache_ttl,
            site_id: current.site.as_ref().map(|site| site.id),
        }
    }

    /// # Errors
    /// Returns [`CoursewareError::Configuration`] when the checkout page path
    /// is empty or longer than [`MAX_CHECKOUT_PAGE_LEN`] characters.
    pub fn validate(&self) -> Result<(), CoursewareError> {
        let page = self.single_course_checkout_page.trim();
        if page.is_empty() {
            return Err(CoursewareError::Configuration(
                "single_course_checkout_page MUST be provided".to_string(),
            ));
        }

        if self.single_course_checkout_page.chars().count() > MAX_CHECKOUT_PAGE_LEN {
            return Err(CoursewareError::Configuration(format!(
                "single_course_checkout_page MUST be at most {MAX_CHECKOUT_PAGE_LEN} characters"
            )));
        }

        if let Some(changed_by) = &self.changed_by {
            if changed_by.trim().is_empty() {
                return Err(CoursewareError::Configuration(
                    "changed_by cannot be blank when provided".to_string(),
                ));
            }
        }

        Ok(())
    }
}
