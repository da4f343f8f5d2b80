use serde::{Deserialize, Serialize};

/// Merchantability utilization classes, in iteration/array order.
///
/// The threshold classes are cumulative: each one covers the trees at or
/// above its diameter limit, so it is a subset of the class before it.
/// `Small` is the sub-merchantable pseudo-class and sits outside the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UtilizationClass {
    /// Every tree in the layer.
    All,
    /// Trees 0cm DBH and larger.
    U0,
    /// Trees 7.5cm DBH and larger.
    U75,
    /// Trees 12.5cm DBH and larger.
    U125,
    /// Trees 17.5cm DBH and larger.
    U175,
    /// Trees 22.5cm DBH and larger.
    U225,
    /// Sub-merchantable trees.
    Small,
}

impl UtilizationClass {
    pub const COUNT: usize = 7;

    /// Every class, in array order.
    pub const ALL_CLASSES: [UtilizationClass; 7] = [
        UtilizationClass::All,
        UtilizationClass::U0,
        UtilizationClass::U75,
        UtilizationClass::U125,
        UtilizationClass::U175,
        UtilizationClass::U225,
        UtilizationClass::Small,
    ];

    /// The cumulative threshold classes, largest population first. Each entry
    /// is a subset of the one before it; `All` is the parent of the chain.
    pub const THRESHOLD_CLASSES: [UtilizationClass; 5] = [
        UtilizationClass::U0,
        UtilizationClass::U75,
        UtilizationClass::U125,
        UtilizationClass::U175,
        UtilizationClass::U225,
    ];

    /// The merchantable classes compatibility variables are computed for.
    pub const MERCHANTABLE_CLASSES: [UtilizationClass; 4] = [
        UtilizationClass::U75,
        UtilizationClass::U125,
        UtilizationClass::U175,
        UtilizationClass::U225,
    ];

    /// Array index of this class.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Lower diameter limit in cm. `All` and `Small` have no limit.
    pub fn lower_bound(self) -> Option<f64> {
        match self {
            UtilizationClass::All | UtilizationClass::Small => None,
            UtilizationClass::U0 => Some(0.0),
            UtilizationClass::U75 => Some(7.5),
            UtilizationClass::U125 => Some(12.5),
            UtilizationClass::U175 => Some(17.5),
            UtilizationClass::U225 => Some(22.5),
        }
    }
}

/// Vertical stratum of a stand within a polygon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LayerType {
    Primary,
    Veteran,
}

impl LayerType {
    pub const COUNT: usize = 2;

    pub const ALL_USED: [LayerType; 2] = [LayerType::Primary, LayerType::Veteran];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A dense per-utilization-class vector of one stand attribute.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtilizationVector([f64; UtilizationClass::COUNT]);

impl UtilizationVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A vector with the same value in every class.
    pub fn uniform(value: f64) -> Self {
        UtilizationVector([value; UtilizationClass::COUNT])
    }

    pub fn get(&self, class: UtilizationClass) -> f64 {
        self.0[class.index()]
    }

    pub fn set(&mut self, class: UtilizationClass, value: f64) {
        self.0[class.index()] = value;
    }

    /// Set every class to `value`.
    pub fn set_all(&mut self, value: f64) {
        self.0 = [value; UtilizationClass::COUNT];
    }

    /// `(class, value)` pairs in array order.
    pub fn iter(&self) -> impl Iterator<Item = (UtilizationClass, f64)> + '_ {
        UtilizationClass::ALL_CLASSES
            .iter()
            .map(move |&uc| (uc, self.get(uc)))
    }
}

impl std::ops::Index<UtilizationClass> for UtilizationVector {
    type Output = f64;

    fn index(&self, class: UtilizationClass) -> &f64 {
        &self.0[class.index()]
    }
}

impl std::ops::IndexMut<UtilizationClass> for UtilizationVector {
    fn index_mut(&mut self, class: UtilizationClass) -> &mut f64 {
        &mut self.0[class.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_order_matches_indexing() {
        for (i, uc) in UtilizationClass::ALL_CLASSES.iter().enumerate() {
            assert_eq!(uc.index(), i);
        }
        assert_eq!(UtilizationClass::ALL_CLASSES.len(), UtilizationClass::COUNT);
    }

    #[test]
    fn test_threshold_chain_is_ordered_by_bound() {
        let mut prev = -1.0;
        for uc in UtilizationClass::THRESHOLD_CLASSES {
            let bound = uc.lower_bound().unwrap();
            assert!(bound > prev);
            prev = bound;
        }
    }

    #[test]
    fn test_vector_get_set() {
        let mut v = UtilizationVector::new();
        assert_eq!(v.get(UtilizationClass::All), 0.0);
        v.set(UtilizationClass::U125, 3.5);
        assert_eq!(v[UtilizationClass::U125], 3.5);
        v[UtilizationClass::Small] = 1.25;
        assert_eq!(v.get(UtilizationClass::Small), 1.25);
    }

    #[test]
    fn test_set_all_covers_every_class() {
        let mut v = UtilizationVector::new();
        v.set_all(2.0);
        for (_, value) in v.iter() {
            assert_eq!(value, 2.0);
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let mut v = UtilizationVector::new();
        v.set(UtilizationClass::All, 19.97867);
        let json = serde_json::to_string(&v).unwrap();
        let back: UtilizationVector = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
