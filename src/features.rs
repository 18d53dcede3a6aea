//! Feature derivation and selection
//!
//! Derived features are declared in a [`FeatureRegistry`] and evaluated in
//! registration order:
//! - joint angle deltas (`up_<joint>_angle − down_<joint>_angle`)
//! - chest displacement (`down_chest_y − up_chest_y`)
//! - rates (delta / rep duration)
//!
//! A derivation applies to a row only when all of its sources are present and
//! its target is absent; values already present are never overwritten.
//!
//! Model inputs are chosen by a [`FeatureSelector`], a declared list of column
//! naming rules.

use crate::flatten::ROM_PREFIX;
use crate::types::{FeatureRow, FeatureTable};

/// Suffix appended to a delta column to name its rate column
pub const RATE_SUFFIX: &str = "_rate";

/// How a derived feature is computed from its sources
#[derive(Debug, Clone, PartialEq)]
pub enum DerivationKind {
    /// `minuend − subtrahend`
    Delta { minuend: String, subtrahend: String },
    /// `numerator / duration_sec`, defined only for a positive duration
    Rate { numerator: String },
}

/// A named feature derived from other columns of the same row
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFeature {
    pub name: String,
    pub kind: DerivationKind,
}

impl DerivedFeature {
    pub fn delta(name: &str, minuend: &str, subtrahend: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: DerivationKind::Delta {
                minuend: minuend.to_string(),
                subtrahend: subtrahend.to_string(),
            },
        }
    }

    pub fn rate(numerator: &str) -> Self {
        Self {
            name: format!("{}{}", numerator, RATE_SUFFIX),
            kind: DerivationKind::Rate {
                numerator: numerator.to_string(),
            },
        }
    }

    /// Columns this feature reads
    pub fn sources(&self) -> Vec<&str> {
        match &self.kind {
            DerivationKind::Delta {
                minuend,
                subtrahend,
            } => vec![minuend.as_str(), subtrahend.as_str()],
            DerivationKind::Rate { numerator } => vec![numerator.as_str()],
        }
    }

    /// Value for `row`, or `None` when the feature is not applicable
    pub fn evaluate(&self, row: &FeatureRow) -> Option<f64> {
        if row.has(&self.name) {
            return None;
        }

        match &self.kind {
            DerivationKind::Delta {
                minuend,
                subtrahend,
            } => compute_delta(row.get(minuend), row.get(subtrahend)),
            DerivationKind::Rate { numerator } => compute_rate(row.get(numerator), row.duration_sec),
        }
    }
}

fn compute_delta(minuend: Option<f64>, subtrahend: Option<f64>) -> Option<f64> {
    match (minuend, subtrahend) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    }
}

/// Zero, negative or missing duration leaves the rate undefined
fn compute_rate(numerator: Option<f64>, duration_sec: Option<f64>) -> Option<f64> {
    match (numerator, duration_sec) {
        (Some(value), Some(duration)) if duration > 0.0 => Some(value / duration),
        _ => None,
    }
}

/// Ordered set of derived features
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRegistry {
    features: Vec<DerivedFeature>,
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl FeatureRegistry {
    /// An empty registry
    pub fn empty() -> Self {
        Self {
            features: Vec::new(),
        }
    }

    /// The push-up feature set: three joint deltas, chest displacement, and a
    /// rate for each of them.
    ///
    /// Chest displacement is `down − up`: image y grows downward, so a chest
    /// that travels down during the rep has a positive displacement.
    pub fn standard() -> Self {
        let mut registry = Self::empty();

        for joint in ["elbow", "shoulder", "hip"] {
            registry = registry.register(DerivedFeature::delta(
                &format!("{}{}_delta", ROM_PREFIX, joint),
                &format!("up_{}_angle", joint),
                &format!("down_{}_angle", joint),
            ));
        }
        registry = registry.register(DerivedFeature::delta(
            &format!("{}chest_displacement", ROM_PREFIX),
            "down_chest_y",
            "up_chest_y",
        ));

        let deltas: Vec<String> = registry.features.iter().map(|f| f.name.clone()).collect();
        for delta in deltas {
            registry = registry.register(DerivedFeature::rate(&delta));
        }

        registry
    }

    /// Append a feature; later features may read earlier ones
    pub fn register(mut self, feature: DerivedFeature) -> Self {
        self.features.push(feature);
        self
    }

    pub fn features(&self) -> &[DerivedFeature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Applies a registry to feature rows
#[derive(Debug, Clone, Default)]
pub struct FeatureEngineer {
    registry: FeatureRegistry,
}

impl FeatureEngineer {
    pub fn new(registry: FeatureRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    /// Derive features for every row of the table, registering each new column
    /// in registry order.
    pub fn engineer(&self, table: &mut FeatureTable) {
        for row in &mut table.rows {
            self.engineer_row(row);
        }

        for feature in self.registry.features() {
            if !table.has_column(&feature.name) && table.rows.iter().any(|r| r.has(&feature.name)) {
                table.register_column(&feature.name);
            }
        }
    }

    /// Derive features for one row; returns the names of the columns added
    pub fn engineer_row(&self, row: &mut FeatureRow) -> Vec<String> {
        let mut added = Vec::new();

        for feature in self.registry.features() {
            if let Some(value) = feature.evaluate(row) {
                row.values.insert(feature.name.clone(), value);
                added.push(feature.name.clone());
            }
        }

        added
    }
}

/// Naming rule for picking model input columns
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnRule {
    Prefix(String),
    Suffix(String),
}

impl ColumnRule {
    pub fn matches(&self, column: &str) -> bool {
        match self {
            ColumnRule::Prefix(prefix) => column.starts_with(prefix.as_str()),
            ColumnRule::Suffix(suffix) => column.ends_with(suffix.as_str()),
        }
    }
}

/// Picks model input columns from a table by declared naming rules
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSelector {
    rules: Vec<ColumnRule>,
}

impl Default for FeatureSelector {
    fn default() -> Self {
        Self::standard()
    }
}

impl FeatureSelector {
    pub fn new(rules: Vec<ColumnRule>) -> Self {
        Self { rules }
    }

    /// Range-of-motion metrics, angles, slopes and rates
    pub fn standard() -> Self {
        Self::new(vec![
            ColumnRule::Prefix(ROM_PREFIX.to_string()),
            ColumnRule::Suffix("_angle".to_string()),
            ColumnRule::Suffix("_slope".to_string()),
            ColumnRule::Suffix(RATE_SUFFIX.to_string()),
        ])
    }

    pub fn rules(&self) -> &[ColumnRule] {
        &self.rules
    }

    /// Matching numeric columns of `table`, in table column order
    pub fn select(&self, table: &FeatureTable) -> Vec<String> {
        table
            .columns
            .iter()
            .filter(|column| self.rules.iter().any(|rule| rule.matches(column)))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::Flattener;
    use crate::types::{MetricMap, RepRecord};
    use pretty_assertions::assert_eq;

    fn make_record(duration: f64, down: &[(&str, f64)], up: &[(&str, f64)]) -> RepRecord {
        RepRecord {
            source_file: "test.json".to_string(),
            rep_number: Some(1),
            duration_sec: Some(duration),
            down: down.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            up: up.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ..Default::default()
        }
    }

    fn engineered(records: &[RepRecord]) -> FeatureTable {
        let mut table = Flattener::flatten(records);
        FeatureEngineer::default().engineer(&mut table);
        table
    }

    #[test]
    fn test_elbow_delta_and_rate() {
        let table = engineered(&[make_record(
            10.0,
            &[("elbow_angle", 90.0)],
            &[("elbow_angle", 170.0)],
        )]);

        let row = &table.rows[0];
        assert_eq!(row.get("rom_elbow_delta"), Some(80.0));
        assert_eq!(row.get("rom_elbow_delta_rate"), Some(8.0));
        assert!(!row.has("rom_shoulder_delta"));
        assert!(!row.has("rom_shoulder_delta_rate"));
    }

    #[test]
    fn test_delta_is_exact_difference() {
        let pairs = [(65.3, 171.9), (10.0, 10.0), (120.25, 95.5)];
        for (down, up) in pairs {
            let table = engineered(&[make_record(1.0, &[("elbow_angle", down)], &[("elbow_angle", up)])]);
            assert_eq!(table.rows[0].get("rom_elbow_delta"), Some(up - down));
        }
    }

    #[test]
    fn test_existing_delta_is_not_overwritten() {
        let mut record = make_record(2.0, &[("elbow_angle", 90.0)], &[("elbow_angle", 170.0)]);
        record.range_of_motion = MetricMap::from([("elbow_delta".to_string(), 75.0)]);

        let table = engineered(&[record]);
        let row = &table.rows[0];
        assert_eq!(row.get("rom_elbow_delta"), Some(75.0));
        // Rates read whatever delta is present
        assert_eq!(row.get("rom_elbow_delta_rate"), Some(37.5));
    }

    #[test]
    fn test_chest_displacement_sign() {
        let table = engineered(&[make_record(
            2.0,
            &[("chest_y", 320.0)],
            &[("chest_y", 270.0)],
        )]);

        let row = &table.rows[0];
        assert_eq!(row.get("rom_chest_displacement"), Some(50.0));
        assert_eq!(row.get("rom_chest_displacement_rate"), Some(25.0));
    }

    #[test]
    fn test_zero_duration_leaves_rate_missing() {
        let table = engineered(&[make_record(
            0.0,
            &[("elbow_angle", 90.0)],
            &[("elbow_angle", 170.0)],
        )]);

        let row = &table.rows[0];
        assert_eq!(row.get("rom_elbow_delta"), Some(80.0));
        assert_eq!(row.get("rom_elbow_delta_rate"), None);
        assert!(!table.has_column("rom_elbow_delta_rate"));
    }

    #[test]
    fn test_missing_duration_leaves_rate_missing() {
        let mut record = make_record(1.0, &[("hip_angle", 150.0)], &[("hip_angle", 175.0)]);
        record.duration_sec = None;

        let table = engineered(&[record]);
        assert_eq!(table.rows[0].get("rom_hip_delta"), Some(25.0));
        assert!(!table.rows[0].has("rom_hip_delta_rate"));
    }

    #[test]
    fn test_derived_columns_registered_in_registry_order() {
        let table = engineered(&[
            make_record(1.0, &[("hip_angle", 150.0)], &[("hip_angle", 170.0)]),
            make_record(
                1.0,
                &[("elbow_angle", 90.0), ("shoulder_angle", 30.0)],
                &[("elbow_angle", 170.0), ("shoulder_angle", 60.0)],
            ),
        ]);

        let derived: Vec<&str> = table
            .columns
            .iter()
            .map(String::as_str)
            .filter(|c| c.starts_with("rom_"))
            .collect();
        assert_eq!(
            derived,
            vec![
                "rom_elbow_delta",
                "rom_shoulder_delta",
                "rom_hip_delta",
                "rom_elbow_delta_rate",
                "rom_shoulder_delta_rate",
                "rom_hip_delta_rate",
            ]
        );
    }

    #[test]
    fn test_standard_registry_order() {
        let registry = FeatureRegistry::standard();
        let names: Vec<&str> = registry.features().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "rom_elbow_delta",
                "rom_shoulder_delta",
                "rom_hip_delta",
                "rom_chest_displacement",
                "rom_elbow_delta_rate",
                "rom_shoulder_delta_rate",
                "rom_hip_delta_rate",
                "rom_chest_displacement_rate",
            ]
        );
        assert_eq!(
            registry.features()[3].sources(),
            vec!["down_chest_y", "up_chest_y"]
        );
    }

    #[test]
    fn test_selector_picks_by_naming_rules() {
        let mut record = make_record(
            2.0,
            &[("elbow_angle", 90.0), ("trunk_slope", 0.2), ("chest_y", 300.0)],
            &[("elbow_angle", 170.0), ("chest_y", 260.0)],
        );
        record.range_of_motion = MetricMap::from([("depth".to_string(), 0.4)]);

        let table = engineered(&[record]);
        let selected = FeatureSelector::standard().select(&table);

        assert_eq!(
            selected,
            vec![
                "down_elbow_angle",
                "down_trunk_slope",
                "up_elbow_angle",
                "rom_depth",
                "rom_elbow_delta",
                "rom_chest_displacement",
                "rom_elbow_delta_rate",
                "rom_chest_displacement_rate",
            ]
        );
    }

    #[test]
    fn test_selector_empty_when_no_match() {
        let table = engineered(&[make_record(1.0, &[("chest_y", 300.0)], &[("hip_y", 260.0)])]);
        assert!(FeatureSelector::standard().select(&table).is_empty());
    }
}
