//! Attribute resolution for heterogeneous reference layers.
//!
//! Shapefiles from different agencies name the same concept differently
//! (`CONDICION`, `TIPO_SUPER`, `RECUBRIMIE`...). Each semantic field carries an
//! ordered alias list. Resolution runs a case-insensitive exact pass over the
//! whole list first and only then a substring pass, so an exact hit on a later
//! alias beats a fuzzy hit on an earlier one. The first alias present with a
//! non-null, non-blank value wins.
//!
//! Resolution is pure and runs once per feature while a layer index is built;
//! the canonical classes are cached on the indexed features.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Feature property set, as read from GeoJSON or a shapefile DBF.
pub type Properties = serde_json::Map<String, Value>;

/// A concept looked up across differently named property keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticField {
    Surface,
    Administration,
    LocalityType,
    RoadType,
    Name,
    Code,
    OwnerMunicipality,
    LocalityCode,
    PopulationTotal,
    PopulationFemale,
    PopulationMale,
    Age0To14,
    Age15To29,
    Age30To59,
    Age60Plus,
    Disability,
}

impl SemanticField {
    /// Ordered alias list, in upper case as published.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            SemanticField::Surface => &[
                "CONDICION",
                "TIPO_SUPER",
                "SUPERFICIE",
                "TIPO_PAVIM",
                "PAVIMENTO",
                "RECUBRIMIE",
                "COND_PAV",
            ],
            SemanticField::Administration => {
                &["ADMINISTRA", "TIPO_ADMIN", "JURISDICCI", "COMPETENCI"]
            }
            SemanticField::LocalityType => &["AMBITO", "TIPO_LOC", "URBAN_RURA", "TIPO"],
            SemanticField::RoadType => &["TIPO_VIAL", "TIPO_VIA", "JERARQUIA"],
            SemanticField::Name => &["NOMGEO", "NOM_MUN", "NOM_LOC", "NOMBRE", "NAME"],
            SemanticField::Code => &["CVEGEO", "CVE_MUN", "CLAVE", "CODE"],
            SemanticField::OwnerMunicipality => &["CVE_MUN", "MUNICIPIO"],
            SemanticField::LocalityCode => &["CVEGEO", "CVE_LOC"],
            SemanticField::PopulationTotal => &["POBTOT"],
            SemanticField::PopulationFemale => &["POBFEM"],
            SemanticField::PopulationMale => &["POBMAS"],
            SemanticField::Age0To14 => &["POB0_14", "P_0A14", "POB_0_14"],
            SemanticField::Age15To29 => &["P_15A29", "POB15_29"],
            SemanticField::Age30To59 => &["P_30A59", "POB30_59"],
            SemanticField::Age60Plus => &["P_60YMAS", "POB60_MAS"],
            SemanticField::Disability => &["PCON_DISC", "POB_DISC", "DISCAPACIDAD"],
        }
    }
}

const ALL_FIELDS: [SemanticField; 16] = [
    SemanticField::Surface,
    SemanticField::Administration,
    SemanticField::LocalityType,
    SemanticField::RoadType,
    SemanticField::Name,
    SemanticField::Code,
    SemanticField::OwnerMunicipality,
    SemanticField::LocalityCode,
    SemanticField::PopulationTotal,
    SemanticField::PopulationFemale,
    SemanticField::PopulationMale,
    SemanticField::Age0To14,
    SemanticField::Age15To29,
    SemanticField::Age30To59,
    SemanticField::Age60Plus,
    SemanticField::Disability,
];

/// Lower-cased alias lists, computed once.
static LOWER_ALIASES: Lazy<HashMap<SemanticField, Vec<String>>> = Lazy::new(|| {
    ALL_FIELDS
        .iter()
        .map(|f| (*f, f.aliases().iter().map(|a| a.to_lowercase()).collect()))
        .collect()
});

/// Road surface class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceClass {
    Paved,
    Unpaved,
    Unknown,
}

/// Administrative jurisdiction of a road.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminClass {
    Federal,
    State,
    Municipal,
    Unknown,
}

/// Urban/rural classification of a locality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ambito {
    Urban,
    Rural,
    Unknown,
}

/// Canonical value of a semantic field.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassValue {
    Surface(SurfaceClass),
    Admin(AdminClass),
    Ambito(Ambito),
    Text(Option<String>),
    Count(u64),
}

/// Resolve the canonical value of `field` from a property set.
pub fn resolve(properties: &Properties, field: SemanticField) -> ClassValue {
    let raw = raw_value(properties, field);
    match field {
        SemanticField::Surface => ClassValue::Surface(
            raw.as_deref().map(classify_surface).unwrap_or(SurfaceClass::Unknown),
        ),
        SemanticField::Administration => ClassValue::Admin(
            raw.as_deref().map(classify_admin).unwrap_or(AdminClass::Unknown),
        ),
        SemanticField::LocalityType => ClassValue::Ambito(
            raw.as_deref().map(classify_ambito).unwrap_or(Ambito::Unknown),
        ),
        SemanticField::RoadType
        | SemanticField::Name
        | SemanticField::Code
        | SemanticField::OwnerMunicipality
        | SemanticField::LocalityCode => ClassValue::Text(raw),
        _ => ClassValue::Count(raw.as_deref().map(parse_count).unwrap_or(0)),
    }
}

pub fn surface_class(properties: &Properties) -> SurfaceClass {
    match resolve(properties, SemanticField::Surface) {
        ClassValue::Surface(s) => s,
        _ => SurfaceClass::Unknown,
    }
}

pub fn admin_class(properties: &Properties) -> AdminClass {
    match resolve(properties, SemanticField::Administration) {
        ClassValue::Admin(a) => a,
        _ => AdminClass::Unknown,
    }
}

pub fn ambito(properties: &Properties) -> Ambito {
    match resolve(properties, SemanticField::LocalityType) {
        ClassValue::Ambito(a) => a,
        _ => Ambito::Unknown,
    }
}

/// Raw string value of a text field, if any alias is present.
pub fn text(properties: &Properties, field: SemanticField) -> Option<String> {
    match resolve(properties, field) {
        ClassValue::Text(t) => t,
        _ => None,
    }
}

/// Non-negative count of a census field; absent or suppressed values are 0.
pub fn count(properties: &Properties, field: SemanticField) -> u64 {
    match resolve(properties, field) {
        ClassValue::Count(n) => n,
        _ => 0,
    }
}

/// Whether any alias of `field` exists as a key, regardless of its value.
pub fn has_field(properties: &Properties, field: SemanticField) -> bool {
    let aliases = &LOWER_ALIASES[&field];
    properties.keys().any(|k| {
        let key = k.to_lowercase();
        aliases.iter().any(|a| key == *a || key.contains(a.as_str()))
    })
}

fn raw_value(properties: &Properties, field: SemanticField) -> Option<String> {
    let aliases = &LOWER_ALIASES[&field];
    let keys: Vec<(String, &Value)> = properties
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();

    // Exact pass over the whole list before any substring match
    for alias in aliases {
        for (key, value) in &keys {
            if key == alias {
                if let Some(s) = value_text(value) {
                    return Some(s);
                }
            }
        }
    }
    for alias in aliases {
        for (key, value) in &keys {
            if key != alias && key.contains(alias.as_str()) {
                if let Some(s) = value_text(value) {
                    return Some(s);
                }
            }
        }
    }
    None
}

fn value_text(value: &Value) -> Option<String> {
    let s = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Map a raw surface label to its class.
pub fn classify_surface(raw: &str) -> SurfaceClass {
    let v = raw.to_lowercase();
    if v.contains("sin pav") {
        SurfaceClass::Unpaved
    } else if v.contains("pav") || v.contains("asfalt") || v.contains("concret") {
        SurfaceClass::Paved
    } else if v.contains("terrace") || v.contains("tierra") || v.contains("brecha") {
        SurfaceClass::Unpaved
    } else {
        SurfaceClass::Unknown
    }
}

/// Map a raw administration label to its class.
pub fn classify_admin(raw: &str) -> AdminClass {
    let v = raw.to_lowercase();
    if v.contains("federal") {
        AdminClass::Federal
    } else if v.contains("estatal") || v.contains("state") {
        AdminClass::State
    } else if v.contains("municipal") || v.contains("local") {
        AdminClass::Municipal
    } else {
        AdminClass::Unknown
    }
}

/// Map a raw locality type to urban/rural.
///
/// Besides the labels, the single-letter and numeric codes used by census
/// catalogs (`U`/`1`, `R`/`2`) are accepted when they are the whole value.
pub fn classify_ambito(raw: &str) -> Ambito {
    let v = raw.trim().to_lowercase();
    match v.as_str() {
        "u" | "1" => return Ambito::Urban,
        "r" | "2" => return Ambito::Rural,
        _ => {}
    }
    if v.contains("urban") {
        Ambito::Urban
    } else if v.contains("rural") {
        Ambito::Rural
    } else {
        Ambito::Unknown
    }
}

/// Parse a census count. `*` marks a suppressed value and counts as 0.
pub fn parse_count(raw: &str) -> u64 {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() || cleaned == "*" {
        return 0;
    }
    match cleaned.parse::<f64>() {
        Ok(n) if n.is_finite() && n > 0.0 => n.round() as u64,
        _ => 0,
    }
}
