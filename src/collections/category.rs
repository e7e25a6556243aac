use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named partition of application data with its own exporter/importer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Audits,
    Vulnerabilities,
    #[serde(rename = "Vulnerability Updates")]
    VulnerabilityUpdates,
    Users,
    Clients,
    Companies,
    Templates,
    #[serde(rename = "Audit Types")]
    AuditTypes,
    #[serde(rename = "Custom Fields")]
    CustomFields,
    #[serde(rename = "Custom Sections")]
    CustomSections,
    #[serde(rename = "Vulnerability Types")]
    VulnerabilityTypes,
    #[serde(rename = "Vulnerability Categories")]
    VulnerabilityCategories,
    Settings,
    /// Reference data every restore needs; never user-selectable
    Languages,
}

/// Directory inside the payload holding template assets
pub const TEMPLATE_ASSETS_DIR: &str = "report-templates";

impl Category {
    /// Categories a caller may select for backup or restore
    pub const SELECTABLE: [Category; 13] = [
        Category::Audits,
        Category::Vulnerabilities,
        Category::VulnerabilityUpdates,
        Category::Users,
        Category::Clients,
        Category::Companies,
        Category::Templates,
        Category::AuditTypes,
        Category::CustomFields,
        Category::CustomSections,
        Category::VulnerabilityTypes,
        Category::VulnerabilityCategories,
        Category::Settings,
    ];

    /// Every category including the internal ones
    pub fn all() -> impl Iterator<Item = Category> {
        Self::SELECTABLE.into_iter().chain(std::iter::once(Category::Languages))
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Category::Audits => "Audits",
            Category::Vulnerabilities => "Vulnerabilities",
            Category::VulnerabilityUpdates => "Vulnerability Updates",
            Category::Users => "Users",
            Category::Clients => "Clients",
            Category::Companies => "Companies",
            Category::Templates => "Templates",
            Category::AuditTypes => "Audit Types",
            Category::CustomFields => "Custom Fields",
            Category::CustomSections => "Custom Sections",
            Category::VulnerabilityTypes => "Vulnerability Types",
            Category::VulnerabilityCategories => "Vulnerability Categories",
            Category::Settings => "Settings",
            Category::Languages => "Languages",
        }
    }

    /// Payload file name, `<camelCaseCategory>.json`
    pub fn file_name(&self) -> &'static str {
        match self {
            Category::Audits => "audits.json",
            Category::Vulnerabilities => "vulnerabilities.json",
            Category::VulnerabilityUpdates => "vulnerabilityUpdates.json",
            Category::Users => "users.json",
            Category::Clients => "clients.json",
            Category::Companies => "companies.json",
            Category::Templates => "templates.json",
            Category::AuditTypes => "auditTypes.json",
            Category::CustomFields => "customFields.json",
            Category::CustomSections => "customSections.json",
            Category::VulnerabilityTypes => "vulnerabilityTypes.json",
            Category::VulnerabilityCategories => "vulnerabilityCategories.json",
            Category::Settings => "settings.json",
            Category::Languages => "languages.json",
        }
    }

    /// Identity field used for upserts. `None` marks a singleton collection.
    ///
    /// Must be a field present in every deployment, never a per-database id.
    pub fn natural_key(&self) -> Option<&'static str> {
        match self {
            Category::Audits => Some("name"),
            Category::Vulnerabilities => Some("title"),
            Category::VulnerabilityUpdates => Some("title"),
            Category::Users => Some("username"),
            Category::Clients => Some("email"),
            Category::Companies => Some("name"),
            Category::Templates => Some("name"),
            Category::AuditTypes => Some("name"),
            Category::CustomFields => Some("label"),
            Category::CustomSections => Some("field"),
            Category::VulnerabilityTypes => Some("name"),
            Category::VulnerabilityCategories => Some("name"),
            Category::Settings => None,
            Category::Languages => Some("locale"),
        }
    }

    pub fn is_selectable(&self) -> bool {
        !matches!(self, Category::Languages)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Category {
    type Err = String;

    /// Accepts display names ("Audit Types") and file stems ("auditTypes"), case-insensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Category::all()
            .find(|c| {
                c.display_name().eq_ignore_ascii_case(wanted)
                    || c.file_name().trim_end_matches(".json").eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| format!("Unknown category: {}", wanted))
    }
}
