//! Static catalogue for the critical-minerals news profile: tracked minerals,
//! query presets and the descriptive lists served by the config API.

use serde::Serialize;

pub static CRITICAL_MINERALS: [&str; 7] = [
    "lithium",
    "cobalt",
    "nickel",
    "rare earth elements",
    "copper",
    "graphite",
    "manganese",
];

pub const DEFAULT_QUERY: &str = "Latest developments in critical minerals including \
lithium, cobalt, nickel, rare earth elements, and mining industry";

pub static REPORT_SECTIONS: [&str; 6] = [
    "Executive Summary",
    "Latest News",
    "Social Media Insights",
    "Market Analysis",
    "Emerging Trends",
    "Sources",
];

pub static GEOGRAPHIC_REGIONS: [&str; 7] = [
    "Global",
    "North America",
    "Europe",
    "Asia-Pacific",
    "Australia",
    "Africa",
    "South America",
];

pub static INDUSTRY_SECTORS: [&str; 6] = [
    "Mining and Extraction",
    "Battery Technology",
    "Electric Vehicles",
    "Renewable Energy",
    "Electronics Manufacturing",
    "Defense and Aerospace",
];

/// Publisher allow-lists, by category.
pub static TRUSTED_DOMAINS: [(&str, &[&str]); 3] = [
    (
        "news",
        &["reuters.com", "bloomberg.com", "ft.com", "wsj.com", "mining.com", "mining-technology.com"],
    ),
    (
        "industry",
        &["mining.com", "mining-journal.com", "resourceworld.com", "mining-technology.com"],
    ),
    ("financial", &["bloomberg.com", "reuters.com", "ft.com", "marketwatch.com"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryPreset {
    pub name: &'static str,
    pub query: &'static str,
    pub description: &'static str,
}

pub static QUERY_PRESETS: [QueryPreset; 8] = [
    QueryPreset {
        name: "general",
        query: DEFAULT_QUERY,
        description: "General critical minerals news and developments",
    },
    QueryPreset {
        name: "lithium",
        query: "Latest news about lithium mining, lithium prices, lithium battery technology, \
and lithium supply chain",
        description: "Focused on lithium mining, prices, and battery tech",
    },
    QueryPreset {
        name: "geopolitics",
        query: "Critical minerals geopolitics, supply chain security, trade policies, \
China rare earths, mining policy, and international competition",
        description: "Supply chain security and international competition",
    },
    QueryPreset {
        name: "sustainability",
        query: "Sustainable mining practices, environmental impact of critical minerals, \
recycling technologies, and green mining innovations",
        description: "Environmental impact and green mining",
    },
    QueryPreset {
        name: "market",
        query: "Critical minerals market prices, supply and demand trends, \
investment opportunities, and commodity trading",
        description: "Prices, supply/demand, and investment",
    },
    QueryPreset {
        name: "technology",
        query: "New mining technologies, critical minerals processing innovations, \
extraction techniques, and battery technology",
        description: "Mining tech and processing innovations",
    },
    QueryPreset {
        name: "supply_chain",
        query: "Critical minerals supply chain disruptions, logistics, \
transportation, and distribution networks",
        description: "Logistics and distribution",
    },
    QueryPreset {
        name: "policy",
        query: "Government policies on critical minerals, regulations, \
strategic reserves, and international agreements",
        description: "Government regulations and policies",
    },
];

pub fn preset(name: &str) -> Option<&'static QueryPreset> {
    let name = name.trim();
    QUERY_PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Query naming the given minerals, or the tracked list when none are given.
pub fn minerals_query<S: AsRef<str>>(minerals: &[S]) -> String {
    let picked: Vec<&str> = minerals
        .iter()
        .map(|m| m.as_ref().trim())
        .filter(|m| !m.is_empty())
        .collect();
    let joined = if picked.is_empty() {
        CRITICAL_MINERALS.join(", ")
    } else {
        picked.join(", ")
    };
    format!("Latest developments in critical minerals including {joined}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minerals_query_falls_back_to_tracked_list() {
        assert_eq!(
            minerals_query(&["cobalt", " nickel "]),
            "Latest developments in critical minerals including cobalt, nickel"
        );
        let empty: [&str; 0] = [];
        assert!(minerals_query(&empty).ends_with("copper, graphite, manganese"));
    }

    #[test]
    fn presets_resolve_case_insensitively() {
        assert_eq!(preset("Lithium").map(|p| p.name), Some("lithium"));
        assert_eq!(preset("general").map(|p| p.query), Some(DEFAULT_QUERY));
        assert!(preset("astrology").is_none());
    }
}
