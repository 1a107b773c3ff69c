//! Walking-distance service area and census population aggregation.
//!
//! The service area is the route geometry buffered by [`WALKING_DISTANCE_M`].
//! Any census block whose geometry overlaps the buffer contributes its whole
//! population (any-overlap policy). This over-counts blocks cut by the buffer
//! edge; the figure is an upper bound.
//!
//! Several routes are combined by unioning their buffers before the block
//! query, so a block served by two routes is counted once.

use std::collections::BTreeMap;
use std::ops::AddAssign;

use geo::Coord;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::attributes::{self, Properties, SemanticField};
use crate::geometry::{Corridor, FeaturePart};
use crate::layers::{CensusBlock, LayerIndex, MunicipalBoundary};

/// Walking distance to a stop, in meters. Fixed, not configurable.
pub const WALKING_DISTANCE_M: f64 = 700.0;

/// Age bracket labels, in display order.
pub const AGE_BRACKETS: [&str; 4] = ["0-14", "15-29", "30-59", "60+"];

/// Raw census counts of one block, or a sum of blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Population {
    pub total: u64,
    pub female: u64,
    pub male: u64,
    pub age_0_14: u64,
    pub age_15_29: u64,
    pub age_30_59: u64,
    pub age_60_plus: u64,
    pub disability: u64,
}

impl Population {
    pub fn from_properties(properties: &Properties) -> Self {
        Self {
            total: attributes::count(properties, SemanticField::PopulationTotal),
            female: attributes::count(properties, SemanticField::PopulationFemale),
            male: attributes::count(properties, SemanticField::PopulationMale),
            age_0_14: attributes::count(properties, SemanticField::Age0To14),
            age_15_29: attributes::count(properties, SemanticField::Age15To29),
            age_30_59: attributes::count(properties, SemanticField::Age30To59),
            age_60_plus: attributes::count(properties, SemanticField::Age60Plus),
            disability: attributes::count(properties, SemanticField::Disability),
        }
    }

    /// Bracket totals in [`AGE_BRACKETS`] order.
    pub fn brackets(&self) -> [u64; 4] {
        [self.age_0_14, self.age_15_29, self.age_30_59, self.age_60_plus]
    }

    /// `self - other` per field, clamped at zero.
    ///
    /// The flag is set when any raw subtraction would have gone negative.
    pub fn clamped_sub(&self, other: &Population) -> (Population, bool) {
        let mut inconsistent = false;
        let mut sub = |a: u64, b: u64| {
            if b > a {
                inconsistent = true;
            }
            a.saturating_sub(b)
        };
        let result = Population {
            total: sub(self.total, other.total),
            female: sub(self.female, other.female),
            male: sub(self.male, other.male),
            age_0_14: sub(self.age_0_14, other.age_0_14),
            age_15_29: sub(self.age_15_29, other.age_15_29),
            age_30_59: sub(self.age_30_59, other.age_30_59),
            age_60_plus: sub(self.age_60_plus, other.age_60_plus),
            disability: sub(self.disability, other.disability),
        };
        (result, inconsistent)
    }
}

impl AddAssign<&Population> for Population {
    fn add_assign(&mut self, rhs: &Population) {
        self.total += rhs.total;
        self.female += rhs.female;
        self.male += rhs.male;
        self.age_0_14 += rhs.age_0_14;
        self.age_15_29 += rhs.age_15_29;
        self.age_30_59 += rhs.age_30_59;
        self.age_60_plus += rhs.age_60_plus;
        self.disability += rhs.disability;
    }
}

impl<'a> std::iter::Sum<&'a Population> for Population {
    fn sum<I: Iterator<Item = &'a Population>>(iter: I) -> Self {
        let mut total = Population::default();
        for p in iter {
            total += p;
        }
        total
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DisabilityStats {
    pub total: u64,
    /// Share of the total population, percent with two decimals
    pub porcentaje: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketTotal {
    pub total: u64,
}

/// Population figures in result shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationStats {
    pub poblacion_total: u64,
    pub poblacion_femenina: u64,
    pub poblacion_masculina: u64,
    pub discapacidad: DisabilityStats,
    pub piramide_poblacional: BTreeMap<String, BracketTotal>,
    pub manzanas_count: usize,
}

impl PopulationStats {
    pub fn new(population: &Population, blocks: usize) -> Self {
        let porcentaje = if population.total > 0 {
            (population.disability as f64 / population.total as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        let piramide_poblacional = AGE_BRACKETS
            .iter()
            .zip(population.brackets())
            .map(|(label, total)| (label.to_string(), BracketTotal { total }))
            .collect();

        Self {
            poblacion_total: population.total,
            poblacion_femenina: population.female,
            poblacion_masculina: population.male,
            discapacidad: DisabilityStats {
                total: population.disability,
                porcentaje,
            },
            piramide_poblacional,
            manzanas_count: blocks,
        }
    }

    /// Raw counts back out of the result shape.
    pub fn population(&self) -> Population {
        let bracket = |label: &str| {
            self.piramide_poblacional
                .get(label)
                .map_or(0, |b| b.total)
        };
        Population {
            total: self.poblacion_total,
            female: self.poblacion_femenina,
            male: self.poblacion_masculina,
            age_0_14: bracket(AGE_BRACKETS[0]),
            age_15_29: bracket(AGE_BRACKETS[1]),
            age_30_59: bracket(AGE_BRACKETS[2]),
            age_60_plus: bracket(AGE_BRACKETS[3]),
            disability: self.discapacidad.total,
        }
    }
}

/// Municipality population not reached by the service area.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnservedStats {
    #[serde(flatten)]
    pub stats: PopulationStats,
    /// Served exceeded the municipality total in some field; values were clamped
    pub inconsistencia: bool,
}

/// Men/women split per age bracket, estimated from bracket totals.
///
/// Census blocks publish bracket totals only. The split applies one
/// male/female ratio, taken from a reference population, to every bracket.
/// It is meant for display and is not census data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SexPyramidApproximation {
    pub proporcion_hombres: f64,
    pub proporcion_mujeres: f64,
    pub piramide: BTreeMap<String, SexSplit>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SexSplit {
    pub hombres: u64,
    pub mujeres: u64,
}

impl SexPyramidApproximation {
    /// Split the brackets of `population` using the sex ratio of `reference`.
    pub fn estimate(population: &Population, reference: &Population) -> Self {
        let sexed = reference.male + reference.female;
        let (male_ratio, female_ratio) = if sexed > 0 {
            (
                reference.male as f64 / sexed as f64,
                reference.female as f64 / sexed as f64,
            )
        } else {
            (0.0, 0.0)
        };

        let piramide = AGE_BRACKETS
            .iter()
            .zip(population.brackets())
            .map(|(label, total)| {
                (
                    label.to_string(),
                    SexSplit {
                        hombres: (total as f64 * male_ratio).round() as u64,
                        mujeres: (total as f64 * female_ratio).round() as u64,
                    },
                )
            })
            .collect();

        Self {
            proporcion_hombres: male_ratio,
            proporcion_mujeres: female_ratio,
            piramide,
        }
    }
}

/// Service-area figures for one route or a union of routes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceArea {
    #[serde(flatten)]
    pub served: PopulationStats,
    /// All blocks of the municipality the service area is restricted to
    pub municipio_total: Option<PopulationStats>,
    pub poblacion_no_atendida: Option<UnservedStats>,
    pub piramide_sexo_aproximada: SexPyramidApproximation,
}

/// Indices of blocks overlapping the union of `lines` buffered by the
/// walking distance, optionally restricted to blocks touching `within`.
pub fn served_blocks(
    lines: &[&[Coord]],
    blocks: &LayerIndex<CensusBlock>,
    within: Option<&[FeaturePart]>,
) -> Vec<usize> {
    let corridor = Corridor::around_all(lines.iter().copied(), WALKING_DISTANCE_M);
    let mut served = blocks.intersecting(&corridor);
    if let Some(area) = within {
        let inside: std::collections::BTreeSet<usize> =
            blocks.intersecting_parts(area).into_iter().collect();
        served.retain(|i| inside.contains(i));
    }
    served
}

/// Sum the population of the given blocks.
pub fn aggregate(blocks: &LayerIndex<CensusBlock>, indices: &[usize]) -> Population {
    indices
        .iter()
        .filter_map(|i| blocks.get(*i))
        .map(|b| &b.population)
        .sum()
}

/// Population of the whole census layer.
pub fn layer_population(blocks: &LayerIndex<CensusBlock>) -> Population {
    blocks.features().iter().map(|b| &b.population).sum()
}

/// `max(0, total - served)` per field, with the inconsistency flag.
pub fn unserved(total: &PopulationStats, served: &PopulationStats) -> UnservedStats {
    let (remaining, inconsistent) = total.population().clamped_sub(&served.population());
    if inconsistent {
        warn!(
            "[ServiceArea] Served population exceeds municipality total ({} > {}); clamped to zero",
            served.poblacion_total, total.poblacion_total
        );
    }
    UnservedStats {
        stats: PopulationStats::new(
            &remaining,
            total.manzanas_count.saturating_sub(served.manzanas_count),
        ),
        inconsistencia: inconsistent,
    }
}

/// Full service-area analysis over one or more route lines.
///
/// With a municipality, served blocks are restricted to that municipality and
/// the municipality total and unserved complement are filled in.
pub fn analyze(
    lines: &[&[Coord]],
    blocks: &LayerIndex<CensusBlock>,
    municipality: Option<&MunicipalBoundary>,
) -> ServiceArea {
    let within = municipality.map(|m| m.parts.as_slice());
    let served_idx = served_blocks(lines, blocks, within);
    let served_pop = aggregate(blocks, &served_idx);
    let served = PopulationStats::new(&served_pop, served_idx.len());

    let (municipio_total, poblacion_no_atendida) = match within {
        Some(area) => {
            let all_idx = blocks.intersecting_parts(area);
            let total = PopulationStats::new(&aggregate(blocks, &all_idx), all_idx.len());
            let missing = unserved(&total, &served);
            (Some(total), Some(missing))
        }
        None => (None, None),
    };

    debug!(
        "[ServiceArea] {} blocks, population {} within {}m",
        served.manzanas_count, served.poblacion_total, WALKING_DISTANCE_M
    );

    ServiceArea {
        piramide_sexo_aproximada: SexPyramidApproximation::estimate(
            &served_pop,
            &layer_population(blocks),
        ),
        served,
        municipio_total,
        poblacion_no_atendida,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::METERS_PER_DEGREE;
    use crate::layers::{LayerFeature, CENSUS_BLOCKS};
    use geo::{polygon, Geometry};
    use serde_json::json;

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    /// 50 m block centered `north_m` meters north of (lon, 0).
    fn block(id: &str, lon: f64, north_m: f64, pop: u64) -> LayerFeature {
        let h = 25.0 / METERS_PER_DEGREE;
        let lat = north_m / METERS_PER_DEGREE;
        let poly = polygon![
            (x: lon - h, y: lat - h),
            (x: lon + h, y: lat - h),
            (x: lon + h, y: lat + h),
            (x: lon - h, y: lat + h),
        ];
        let props = json!({
            "POBTOT": pop,
            "POBFEM": pop / 2,
            "POBMAS": pop - pop / 2,
            "P_0A14": pop / 4,
            "P_15A29": pop / 4,
            "P_30A59": pop / 4,
            "P_60YMAS": pop - 3 * (pop / 4),
            "PCON_DISC": pop / 10,
        });
        LayerFeature::new(
            id,
            Geometry::Polygon(poly),
            props.as_object().cloned().unwrap_or_default(),
        )
    }

    fn index(features: Vec<LayerFeature>) -> LayerIndex<CensusBlock> {
        LayerIndex::from_features(CENSUS_BLOCKS, features)
    }

    #[test]
    fn test_any_overlap_counts_whole_block() {
        let blocks = index(vec![
            block("near", 0.0, 300.0, 100),
            block("edge", 0.0, 720.0, 40), // south edge at 695 m
            block("far", 0.0, 2000.0, 999),
        ]);
        let line = vec![c(-0.01, 0.0), c(0.01, 0.0)];
        let area = analyze(&[line.as_slice()], &blocks, None);
        assert_eq!(area.served.poblacion_total, 140);
        assert_eq!(area.served.manzanas_count, 2);
        assert!(area.municipio_total.is_none());
    }

    #[test]
    fn test_union_counts_block_once() {
        let blocks = index(
            (0..10)
                .map(|i| block(&i.to_string(), i as f64 * 0.001, 100.0, 50))
                .collect(),
        );
        let a = vec![c(-0.001, 0.0), c(0.011, 0.0)];
        let b = vec![c(-0.001, 0.00001), c(0.011, 0.00001)];

        let single = aggregate(&blocks, &served_blocks(&[a.as_slice()], &blocks, None));
        let union = aggregate(
            &blocks,
            &served_blocks(&[a.as_slice(), b.as_slice()], &blocks, None),
        );
        assert_eq!(single.total, 500);
        assert_eq!(union.total, 500);
    }

    fn served_total(blocks: &LayerIndex<CensusBlock>, lines: &[&[Coord]]) -> u64 {
        aggregate(blocks, &served_blocks(lines, blocks, None)).total
    }

    #[test]
    fn test_disjoint_buffers_add_up() {
        // ~5.5 km apart, far beyond two walking distances
        let blocks = index(vec![block("west", 0.0, 100.0, 100), block("east", 0.05, 100.0, 200)]);
        let a = vec![c(-0.001, 0.0), c(0.001, 0.0)];
        let b = vec![c(0.049, 0.0), c(0.051, 0.0)];

        let served_a = served_total(&blocks, &[a.as_slice()]);
        let served_b = served_total(&blocks, &[b.as_slice()]);
        let union = served_total(&blocks, &[a.as_slice(), b.as_slice()]);
        assert_eq!((served_a, served_b), (100, 200));
        assert_eq!(union, served_a + served_b);
    }

    #[test]
    fn test_partly_overlapping_buffers_count_shared_block_once() {
        // Blocks ~1.1 km apart; each line reaches two of them
        let blocks = index(vec![
            block("0", 0.0, 100.0, 10),
            block("1", 0.01, 100.0, 20),
            block("2", 0.02, 100.0, 30),
        ]);
        let a = vec![c(-0.002, 0.0), c(0.012, 0.0)];
        let b = vec![c(0.008, 0.0), c(0.022, 0.0)];

        let served_a = served_total(&blocks, &[a.as_slice()]);
        let served_b = served_total(&blocks, &[b.as_slice()]);
        let union = served_total(&blocks, &[a.as_slice(), b.as_slice()]);
        assert_eq!((served_a, served_b), (30, 50));
        assert_eq!(union, 60);
        assert!(union < served_a + served_b);
    }

    #[test]
    fn test_disability_percentage() {
        let pop = Population {
            total: 300,
            disability: 7,
            ..Default::default()
        };
        let stats = PopulationStats::new(&pop, 3);
        assert_eq!(stats.discapacidad.porcentaje, 2.33);
        assert_eq!(stats.piramide_poblacional.len(), 4);
        assert_eq!(stats.population(), pop);
    }

    #[test]
    fn test_unserved_clamps_and_flags() {
        let total = PopulationStats::new(
            &Population {
                total: 100,
                female: 40,
                ..Default::default()
            },
            5,
        );
        let served = PopulationStats::new(
            &Population {
                total: 60,
                female: 50,
                ..Default::default()
            },
            2,
        );
        let missing = unserved(&total, &served);
        assert_eq!(missing.stats.poblacion_total, 40);
        assert_eq!(missing.stats.poblacion_femenina, 0);
        assert_eq!(missing.stats.manzanas_count, 3);
        assert!(missing.inconsistencia);

        let fine = unserved(&total, &PopulationStats::new(&Population::default(), 0));
        assert_eq!(fine.stats.poblacion_total, 100);
        assert!(!fine.inconsistencia);
    }

    #[test]
    fn test_sex_pyramid_uses_reference_ratio() {
        let reference = Population {
            male: 300,
            female: 700,
            ..Default::default()
        };
        let served = Population {
            age_0_14: 100,
            age_60_plus: 10,
            ..Default::default()
        };
        let approx = SexPyramidApproximation::estimate(&served, &reference);
        assert_eq!(approx.piramide["0-14"], SexSplit { hombres: 30, mujeres: 70 });
        assert_eq!(approx.piramide["60+"], SexSplit { hombres: 3, mujeres: 7 });
        assert_eq!(approx.piramide["15-29"], SexSplit::default());
    }

    #[test]
    fn test_population_from_properties() {
        let f = block("b", 0.0, 0.0, 100);
        let pop = Population::from_properties(&f.properties);
        assert_eq!(pop.total, 100);
        assert_eq!(pop.female, 50);
        assert_eq!(pop.brackets().iter().sum::<u64>(), 100);
        assert_eq!(pop.disability, 10);
    }
}
