//! Enforcement of the basal-area / stem-density / diameter identity across
//! utilization classes.

use crate::estimate;
use crate::models::{UtilizationClass, UtilizationVector};

/// Re-derive trees per hectare from basal area and quadratic mean diameter,
/// then nudge all three vectors so that `BA = K * TPH * QMD²` holds for every
/// utilization class and no threshold class exceeds its parent.
///
/// Zero basal area in a class zeroes the class. A class with basal area but
/// neither diameter nor density inherits its parent's diameter; if there is
/// nothing to inherit the class is zeroed rather than left inconsistent.
pub fn reconcile(
    ba: &mut UtilizationVector,
    tph: &mut UtilizationVector,
    qmd: &mut UtilizationVector,
) {
    resolve_class(ba, tph, qmd, UtilizationClass::All, 0.0);
    resolve_class(ba, tph, qmd, UtilizationClass::Small, 0.0);

    let mut parent = UtilizationClass::All;
    for uc in UtilizationClass::THRESHOLD_CLASSES {
        resolve_class(ba, tph, qmd, uc, qmd.get(parent));

        // threshold classes are subsets of their parent
        if ba.get(uc) > ba.get(parent) {
            ba.set(uc, ba.get(parent));
        }
        if tph.get(uc) > tph.get(parent) {
            tph.set(uc, tph.get(parent));
        }
        // re-derive the diameter so the identity is exact after clamping
        qmd.set(uc, estimate::quad_mean_diameter(ba.get(uc), tph.get(uc)));
        if qmd.get(uc) <= 0.0 {
            ba.set(uc, 0.0);
            tph.set(uc, 0.0);
        }

        parent = uc;
    }
}

fn resolve_class(
    ba: &mut UtilizationVector,
    tph: &mut UtilizationVector,
    qmd: &mut UtilizationVector,
    uc: UtilizationClass,
    fallback_qmd: f64,
) {
    let b = ba.get(uc);
    if b <= 0.0 {
        ba.set(uc, 0.0);
        tph.set(uc, 0.0);
        qmd.set(uc, 0.0);
        return;
    }

    let mut d = qmd.get(uc);
    if d <= 0.0 {
        d = if tph.get(uc) > 0.0 {
            estimate::quad_mean_diameter(b, tph.get(uc))
        } else {
            fallback_qmd
        };
    }
    if d <= 0.0 {
        ba.set(uc, 0.0);
        tph.set(uc, 0.0);
        qmd.set(uc, 0.0);
        return;
    }

    tph.set(uc, estimate::trees_per_hectare(b, d));
    qmd.set(uc, d);
}
