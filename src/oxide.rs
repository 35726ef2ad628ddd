//! Gravimetric conversion factors from element to oxide concentration
//!
//! Each entry describes the oxide formula reported for an element. The conversion factor is the
//! molar mass of the oxide divided by the mass of the element it contains,
//!
//! $$
//!     f = \frac{n M_{el} + m M_O}{n M_{el}}
//! $$
//!
//! for an oxide $El_n O_m$.

const OXYGEN: f64 = 15.999;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OxideSpec {
    pub element: &'static str,
    pub formula: &'static str,
    metal_atoms: u32,
    oxygen_atoms: u32,
    atomic_mass: f64,
}

impl OxideSpec {
    const fn new(
        element: &'static str,
        formula: &'static str,
        metal_atoms: u32,
        oxygen_atoms: u32,
        atomic_mass: f64,
    ) -> Self {
        Self {
            element,
            formula,
            metal_atoms,
            oxygen_atoms,
            atomic_mass,
        }
    }

    /// Multiply an element concentration by this to obtain the oxide concentration
    pub fn factor(&self) -> f64 {
        let metal = f64::from(self.metal_atoms) * self.atomic_mass;
        (metal + f64::from(self.oxygen_atoms) * OXYGEN) / metal
    }
}

pub const OXIDES: &[OxideSpec] = &[
    OxideSpec::new("Al", "Al2O3", 2, 3, 26.982),
    OxideSpec::new("As", "As2O3", 2, 3, 74.922),
    OxideSpec::new("B", "B2O3", 2, 3, 10.81),
    OxideSpec::new("Ba", "BaO", 1, 1, 137.327),
    OxideSpec::new("Be", "BeO", 1, 1, 9.0122),
    OxideSpec::new("Bi", "Bi2O3", 2, 3, 208.98),
    OxideSpec::new("Ca", "CaO", 1, 1, 40.078),
    OxideSpec::new("Cd", "CdO", 1, 1, 112.414),
    OxideSpec::new("Ce", "CeO2", 1, 2, 140.116),
    OxideSpec::new("Co", "CoO", 1, 1, 58.933),
    OxideSpec::new("Cr", "Cr2O3", 2, 3, 51.996),
    OxideSpec::new("Cs", "Cs2O", 2, 1, 132.905),
    OxideSpec::new("Cu", "CuO", 1, 1, 63.546),
    OxideSpec::new("Fe", "Fe2O3", 2, 3, 55.845),
    OxideSpec::new("Ga", "Ga2O3", 2, 3, 69.723),
    OxideSpec::new("Ge", "GeO2", 1, 2, 72.63),
    OxideSpec::new("Hf", "HfO2", 1, 2, 178.49),
    OxideSpec::new("K", "K2O", 2, 1, 39.098),
    OxideSpec::new("La", "La2O3", 2, 3, 138.905),
    OxideSpec::new("Li", "Li2O", 2, 1, 6.94),
    OxideSpec::new("Mg", "MgO", 1, 1, 24.305),
    OxideSpec::new("Mn", "MnO", 1, 1, 54.938),
    OxideSpec::new("Mo", "MoO3", 1, 3, 95.95),
    OxideSpec::new("Na", "Na2O", 2, 1, 22.99),
    OxideSpec::new("Nb", "Nb2O5", 2, 5, 92.906),
    OxideSpec::new("Ni", "NiO", 1, 1, 58.693),
    OxideSpec::new("P", "P2O5", 2, 5, 30.974),
    OxideSpec::new("Pb", "PbO", 1, 1, 207.2),
    OxideSpec::new("Rb", "Rb2O", 2, 1, 85.468),
    OxideSpec::new("S", "SO3", 1, 3, 32.06),
    OxideSpec::new("Sb", "Sb2O3", 2, 3, 121.76),
    OxideSpec::new("Sc", "Sc2O3", 2, 3, 44.956),
    OxideSpec::new("Si", "SiO2", 1, 2, 28.086),
    OxideSpec::new("Sn", "SnO2", 1, 2, 118.71),
    OxideSpec::new("Sr", "SrO", 1, 1, 87.62),
    OxideSpec::new("Ta", "Ta2O5", 2, 5, 180.948),
    OxideSpec::new("Th", "ThO2", 1, 2, 232.038),
    OxideSpec::new("Ti", "TiO2", 1, 2, 47.867),
    OxideSpec::new("U", "U3O8", 3, 8, 238.029),
    OxideSpec::new("V", "V2O5", 2, 5, 50.942),
    OxideSpec::new("W", "WO3", 1, 3, 183.84),
    OxideSpec::new("Y", "Y2O3", 2, 3, 88.906),
    OxideSpec::new("Zn", "ZnO", 1, 1, 65.38),
    OxideSpec::new("Zr", "ZrO2", 1, 2, 91.224),
];

/// Look up the oxide reported for an element symbol
pub fn lookup(symbol: &str) -> Option<&'static OxideSpec> {
    OXIDES
        .iter()
        .find(|spec| spec.element.eq_ignore_ascii_case(symbol))
}

#[cfg(test)]
mod tests {
    use super::{lookup, OXIDES};

    #[test]
    fn common_rock_forming_factors_match_published_values() {
        let expected = [
            ("Si", 2.1393),
            ("Al", 1.8895),
            ("Fe", 1.4297),
            ("Ca", 1.3992),
            ("Mg", 1.6582),
            ("K", 1.2046),
            ("Na", 1.3480),
            ("P", 2.2914),
        ];
        for (symbol, factor) in expected {
            let spec = lookup(symbol).unwrap();
            approx::assert_relative_eq!(spec.factor(), factor, max_relative = 1e-3);
        }
    }

    #[test]
    fn every_factor_exceeds_unity() {
        for spec in OXIDES {
            assert!(spec.factor() > 1.0, "{} has factor <= 1", spec.formula);
        }
    }

    #[test]
    fn unknown_symbols_have_no_oxide() {
        assert!(lookup("Au").is_none());
        assert!(lookup("fe").is_some());
    }
}
