use serde::{Deserialize, Serialize};

use super::utilization::{LayerType, UtilizationClass};

/// The volume kinds a per-class volume compatibility variable exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeVariable {
    WholeStem,
    CloseUtil,
    CloseUtilNetDecay,
    CloseUtilNetDecayWaste,
}

impl VolumeVariable {
    pub const COUNT: usize = 4;

    pub const ALL: [VolumeVariable; 4] = [
        VolumeVariable::WholeStem,
        VolumeVariable::CloseUtil,
        VolumeVariable::CloseUtilNetDecay,
        VolumeVariable::CloseUtilNetDecayWaste,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// The variables the small-component (sub-merchantable) table is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SmallVariable {
    BasalArea,
    QuadMeanDiameter,
    LoreyHeight,
    WholeStemVolume,
}

impl SmallVariable {
    pub const COUNT: usize = 4;

    pub const ALL: [SmallVariable; 4] = [
        SmallVariable::BasalArea,
        SmallVariable::QuadMeanDiameter,
        SmallVariable::LoreyHeight,
        SmallVariable::WholeStemVolume,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Per-species additive adjustments reconciling fitted curves against the
/// supplied stand data.
///
/// The tables are flat arrays indexed by the small dense enum ordinals
/// (utilization class, variable kind, layer type); the accessors are the only
/// way in or out, so an index is always in bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityVariables {
    cv_volume: [[[f64; LayerType::COUNT]; VolumeVariable::COUNT]; UtilizationClass::COUNT],
    cv_basal_area: [[f64; LayerType::COUNT]; UtilizationClass::COUNT],
    cv_quad_mean_diameter: [[f64; LayerType::COUNT]; UtilizationClass::COUNT],
    cv_small: [f64; SmallVariable::COUNT],
}

impl Default for CompatibilityVariables {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl CompatibilityVariables {
    /// All adjustments zero: fitted curves taken as-is.
    pub fn zeroed() -> Self {
        CompatibilityVariables {
            cv_volume: [[[0.0; LayerType::COUNT]; VolumeVariable::COUNT]; UtilizationClass::COUNT],
            cv_basal_area: [[0.0; LayerType::COUNT]; UtilizationClass::COUNT],
            cv_quad_mean_diameter: [[0.0; LayerType::COUNT]; UtilizationClass::COUNT],
            cv_small: [0.0; SmallVariable::COUNT],
        }
    }

    pub fn volume(&self, uc: UtilizationClass, vv: VolumeVariable, lt: LayerType) -> f64 {
        self.cv_volume[uc.index()][vv.index()][lt.index()]
    }

    pub fn set_volume(&mut self, uc: UtilizationClass, vv: VolumeVariable, lt: LayerType, v: f64) {
        self.cv_volume[uc.index()][vv.index()][lt.index()] = v;
    }

    pub fn basal_area(&self, uc: UtilizationClass, lt: LayerType) -> f64 {
        self.cv_basal_area[uc.index()][lt.index()]
    }

    pub fn set_basal_area(&mut self, uc: UtilizationClass, lt: LayerType, v: f64) {
        self.cv_basal_area[uc.index()][lt.index()] = v;
    }

    pub fn quad_mean_diameter(&self, uc: UtilizationClass, lt: LayerType) -> f64 {
        self.cv_quad_mean_diameter[uc.index()][lt.index()]
    }

    pub fn set_quad_mean_diameter(&mut self, uc: UtilizationClass, lt: LayerType, v: f64) {
        self.cv_quad_mean_diameter[uc.index()][lt.index()] = v;
    }

    pub fn small(&self, sv: SmallVariable) -> f64 {
        self.cv_small[sv.index()]
    }

    pub fn set_small(&mut self, sv: SmallVariable, v: f64) {
        self.cv_small[sv.index()] = v;
    }

    /// Scale every adjustment by per-class, per-variable factors. Used after
    /// a growth year to age the calibration.
    pub fn scale<FV, FB, FQ, FS>(&mut self, volume: FV, basal_area: FB, qmd: FQ, small: FS)
    where
        FV: Fn(UtilizationClass, VolumeVariable) -> f64,
        FB: Fn(UtilizationClass) -> f64,
        FQ: Fn(UtilizationClass) -> f64,
        FS: Fn(SmallVariable) -> f64,
    {
        for uc in UtilizationClass::ALL_CLASSES {
            for lt in LayerType::ALL_USED {
                for vv in VolumeVariable::ALL {
                    self.cv_volume[uc.index()][vv.index()][lt.index()] *= volume(uc, vv);
                }
                self.cv_basal_area[uc.index()][lt.index()] *= basal_area(uc);
                self.cv_quad_mean_diameter[uc.index()][lt.index()] *= qmd(uc);
            }
        }
        for sv in SmallVariable::ALL {
            self.cv_small[sv.index()] *= small(sv);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_tables() {
        let cv = CompatibilityVariables::zeroed();
        for uc in UtilizationClass::ALL_CLASSES {
            for lt in LayerType::ALL_USED {
                assert_eq!(cv.basal_area(uc, lt), 0.0);
                for vv in VolumeVariable::ALL {
                    assert_eq!(cv.volume(uc, vv, lt), 0.0);
                }
            }
        }
        for sv in SmallVariable::ALL {
            assert_eq!(cv.small(sv), 0.0);
        }
    }

    #[test]
    fn test_set_and_get_are_per_cell() {
        let mut cv = CompatibilityVariables::zeroed();
        cv.set_volume(
            UtilizationClass::U125,
            VolumeVariable::CloseUtilNetDecay,
            LayerType::Primary,
            -0.25,
        );
        assert_eq!(
            cv.volume(
                UtilizationClass::U125,
                VolumeVariable::CloseUtilNetDecay,
                LayerType::Primary
            ),
            -0.25
        );
        // neighbours untouched
        assert_eq!(
            cv.volume(
                UtilizationClass::U125,
                VolumeVariable::CloseUtil,
                LayerType::Primary
            ),
            0.0
        );
        assert_eq!(
            cv.volume(
                UtilizationClass::U125,
                VolumeVariable::CloseUtilNetDecay,
                LayerType::Veteran
            ),
            0.0
        );
    }

    #[test]
    fn test_scale_applies_factors() {
        let mut cv = CompatibilityVariables::zeroed();
        cv.set_basal_area(UtilizationClass::U75, LayerType::Primary, 2.0);
        cv.set_small(SmallVariable::LoreyHeight, 4.0);
        cv.scale(|_, _| 1.0, |_| 0.5, |_| 1.0, |_| 0.25);
        assert_eq!(cv.basal_area(UtilizationClass::U75, LayerType::Primary), 1.0);
        assert_eq!(cv.small(SmallVariable::LoreyHeight), 1.0);
    }
}
