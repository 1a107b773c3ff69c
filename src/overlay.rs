//! Territorial overlay: municipalities traversed by a route and the
//! localities it serves.

use std::collections::{BTreeMap, BTreeSet};

use geo::Coord;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::attributes::Ambito;
use crate::geometry::Corridor;
use crate::layers::{LayerIndex, Locality, MunicipalBoundary};

/// Minimum length of the shorter code for a suffix match.
const MIN_SUFFIX_CODE_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalityRef {
    pub nombre: String,
    pub clave: Option<String>,
}

impl LocalityRef {
    /// Identity used for deduplication: the code when present, else the name.
    pub fn key(&self) -> String {
        match &self.clave {
            Some(code) => format!("clave:{}", code),
            None => format!("nombre:{}", self.nombre.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversedMunicipality {
    pub nombre: String,
    pub clave: String,
    pub localidades_urbanas: Vec<LocalityRef>,
    pub localidades_rurales: Vec<LocalityRef>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerritorialOverlay {
    /// Sorted by name, then code; one entry per code
    pub municipios: Vec<TraversedMunicipality>,
    /// Distinct urban localities across all municipalities
    pub total_urbanas: usize,
    pub total_rurales: usize,
    /// Some locality was attributed without an owner-municipality code
    pub localidades_sin_municipio: bool,
}

/// Whether a locality's owner code refers to the municipality code.
///
/// Layers mix full geostatistical keys (`14120`) with municipality-only keys
/// (`120`), so a code also matches when the longer one ends with the shorter.
pub fn codes_match(municipality: &str, owner: &str) -> bool {
    let (a, b) = (municipality.trim(), owner.trim());
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    short.len() >= MIN_SUFFIX_CODE_LEN && long.ends_with(short)
}

fn sort_and_dedup(list: &mut Vec<LocalityRef>) {
    let mut seen = BTreeSet::new();
    list.retain(|l| seen.insert(l.key()));
    list.sort();
}

/// Overlay the raw track, buffered by `buffer_m`, on municipalities and
/// (optionally) localities.
pub fn overlay(
    track: &[Coord],
    municipalities: &LayerIndex<MunicipalBoundary>,
    localities: Option<&LayerIndex<Locality>>,
    buffer_m: f64,
) -> TerritorialOverlay {
    let corridor = Corridor::around(track, buffer_m);

    // Traversed municipalities, merged by code (first feature names it)
    let mut by_code: BTreeMap<String, TraversedMunicipality> = BTreeMap::new();
    for idx in municipalities.intersecting(&corridor) {
        let Some(m) = municipalities.get(idx) else {
            continue;
        };
        by_code
            .entry(m.code.clone())
            .or_insert_with(|| TraversedMunicipality {
                nombre: m.name.clone(),
                clave: m.code.clone(),
                localidades_urbanas: Vec::new(),
                localidades_rurales: Vec::new(),
            });
    }

    let mut ownerless = false;
    if let Some(localities) = localities {
        for idx in localities.intersecting(&corridor) {
            let Some(loc) = localities.get(idx) else {
                continue;
            };
            let entry = LocalityRef {
                nombre: loc.name.clone(),
                clave: loc.code.clone(),
            };
            if loc.municipality_code.is_none() {
                ownerless = true;
            }
            for m in by_code.values_mut() {
                let owned = loc
                    .municipality_code
                    .as_deref()
                    .map_or(true, |owner| codes_match(&m.clave, owner));
                if !owned {
                    continue;
                }
                match loc.ambito {
                    Ambito::Urban => m.localidades_urbanas.push(entry.clone()),
                    Ambito::Rural => m.localidades_rurales.push(entry.clone()),
                    Ambito::Unknown => {}
                }
            }
        }
    }
    if ownerless && !by_code.is_empty() {
        warn!("[Overlay] Localities without owner municipality were attributed by buffer only");
    }

    let mut municipios: Vec<TraversedMunicipality> = by_code.into_values().collect();
    for m in &mut municipios {
        sort_and_dedup(&mut m.localidades_urbanas);
        sort_and_dedup(&mut m.localidades_rurales);
    }
    municipios.sort_by(|a, b| a.nombre.cmp(&b.nombre).then_with(|| a.clave.cmp(&b.clave)));

    let mut urban_keys = BTreeSet::new();
    let mut rural_keys = BTreeSet::new();
    for m in &municipios {
        urban_keys.extend(m.localidades_urbanas.iter().map(LocalityRef::key));
        rural_keys.extend(m.localidades_rurales.iter().map(LocalityRef::key));
    }
    let total_urbanas = urban_keys.len();
    let total_rurales = rural_keys.len();

    debug!(
        "[Overlay] {} municipalities, {} urban and {} rural localities",
        municipios.len(),
        total_urbanas,
        total_rurales
    );

    TerritorialOverlay {
        municipios,
        total_urbanas,
        total_rurales,
        localidades_sin_municipio: ownerless,
    }
}
