//! Property catalog and alias resolution.
//!
//! Every retrievable property has a canonical `snake_case` name, a value
//! kind, and a [`Source`]: either one or more PubChem property-table tags
//! (tried in order, first non-empty wins) or a dedicated per-compound lookup.
//!
//! Callers may spell properties loosely: canonical names, PubChem CamelCase
//! tags, lower-case or underscore-free variants and a handful of legacy
//! aliases all resolve to the same entry.

use std::collections::HashSet;

use thiserror::Error;

/// Probe tag used to confirm keys exist when no batch property was requested.
pub const EXISTENCE_PROBE_TAG: &str = "MolecularFormula";

/// Declared type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Free text (formulas, SMILES, names).
    Text,
    /// Floating-point number; numeric strings are coerced.
    Float,
    /// Integer; integral numbers and integer strings are coerced.
    Integer,
    /// List of strings.
    List,
}

/// Special per-compound lookups that do not come from the property table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Special {
    /// CAS registry number from the PUG-View record.
    Cas,
    /// Synonym list.
    Synonyms,
}

/// Where a property's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Batch property table, with fallback tags.
    Tags(&'static [&'static str]),
    /// Dedicated per-key request.
    Special(Special),
}

/// One catalog entry.
#[derive(Debug, PartialEq, Eq)]
pub struct PropertySpec {
    /// Canonical snake_case name.
    pub name: &'static str,
    /// Value kind used during validation.
    pub kind: ValueKind,
    /// Value source.
    pub source: Source,
    /// Member of the commonly used core set.
    pub core: bool,
}

impl PropertySpec {
    /// Property-table tags for this property (empty for special properties).
    #[must_use]
    pub fn tags(&self) -> &'static [&'static str] {
        match self.source {
            Source::Tags(tags) => tags,
            Source::Special(_) => &[],
        }
    }

    /// Returns the special lookup, if any.
    #[must_use]
    pub fn special(&self) -> Option<Special> {
        match self.source {
            Source::Special(special) => Some(special),
            Source::Tags(_) => None,
        }
    }

    /// True for the 3D conformer descriptors.
    #[must_use]
    pub fn is_3d(&self) -> bool {
        self.name.ends_with("_3d")
    }
}

macro_rules! tagged {
    ($name:literal, $kind:ident, [$($tag:literal),+], $core:literal) => {
        PropertySpec {
            name: $name,
            kind: ValueKind::$kind,
            source: Source::Tags(&[$($tag),+]),
            core: $core,
        }
    };
}

/// The full catalog, in display order.
pub static CATALOG: &[PropertySpec] = &[
    tagged!("molecular_formula", Text, ["MolecularFormula"], true),
    tagged!("molecular_weight", Float, ["MolecularWeight"], true),
    tagged!("canonical_smiles", Text, ["CanonicalSMILES", "ConnectivitySMILES"], true),
    tagged!("isomeric_smiles", Text, ["IsomericSMILES", "SMILES"], true),
    tagged!("inchi", Text, ["InChI"], true),
    tagged!("inchi_key", Text, ["InChIKey"], true),
    tagged!("iupac_name", Text, ["IUPACName"], true),
    tagged!("xlogp", Float, ["XLogP"], true),
    tagged!("exact_mass", Float, ["ExactMass"], true),
    tagged!("monoisotopic_mass", Float, ["MonoisotopicMass"], true),
    tagged!("tpsa", Float, ["TPSA"], true),
    tagged!("complexity", Float, ["Complexity"], true),
    tagged!("charge", Integer, ["Charge"], true),
    tagged!("h_bond_donor_count", Integer, ["HBondDonorCount"], true),
    tagged!("h_bond_acceptor_count", Integer, ["HBondAcceptorCount"], true),
    tagged!("rotatable_bond_count", Integer, ["RotatableBondCount"], true),
    tagged!("heavy_atom_count", Integer, ["HeavyAtomCount"], true),
    tagged!("isotope_atom_count", Integer, ["IsotopeAtomCount"], false),
    tagged!("atom_stereo_count", Integer, ["AtomStereoCount"], true),
    tagged!("defined_atom_stereo_count", Integer, ["DefinedAtomStereoCount"], false),
    tagged!("undefined_atom_stereo_count", Integer, ["UndefinedAtomStereoCount"], false),
    tagged!("bond_stereo_count", Integer, ["BondStereoCount"], true),
    tagged!("defined_bond_stereo_count", Integer, ["DefinedBondStereoCount"], false),
    tagged!("undefined_bond_stereo_count", Integer, ["UndefinedBondStereoCount"], false),
    tagged!("covalent_unit_count", Integer, ["CovalentUnitCount"], true),
    tagged!("volume_3d", Float, ["Volume3D"], false),
    tagged!("x_steric_quadrupole_3d", Float, ["XStericQuadrupole3D"], false),
    tagged!("y_steric_quadrupole_3d", Float, ["YStericQuadrupole3D"], false),
    tagged!("z_steric_quadrupole_3d", Float, ["ZStericQuadrupole3D"], false),
    tagged!("feature_count_3d", Integer, ["FeatureCount3D"], false),
    tagged!("feature_acceptor_count_3d", Integer, ["FeatureAcceptorCount3D"], false),
    tagged!("feature_donor_count_3d", Integer, ["FeatureDonorCount3D"], false),
    tagged!("feature_anion_count_3d", Integer, ["FeatureAnionCount3D"], false),
    tagged!("feature_cation_count_3d", Integer, ["FeatureCationCount3D"], false),
    tagged!("feature_ring_count_3d", Integer, ["FeatureRingCount3D"], false),
    tagged!("feature_hydrophobe_count_3d", Integer, ["FeatureHydrophobeCount3D"], false),
    tagged!("conformer_model_rmsd_3d", Float, ["ConformerModelRMSD3D"], false),
    tagged!("effective_rotor_count_3d", Float, ["EffectiveRotorCount3D"], false),
    tagged!("conformer_count_3d", Integer, ["ConformerCount3D"], false),
    PropertySpec {
        name: "cas",
        kind: ValueKind::Text,
        source: Source::Special(Special::Cas),
        core: true,
    },
    PropertySpec {
        name: "synonyms",
        kind: ValueKind::List,
        source: Source::Special(Special::Synonyms),
        core: true,
    },
];

/// Legacy and convenience spellings that do not fall out of flattening.
const EXTRA_ALIASES: &[(&str, &str)] = &[
    ("smiles", "canonical_smiles"),
    ("connectivity_smiles", "canonical_smiles"),
    ("logp", "xlogp"),
    ("x_log_p", "xlogp"),
    ("hbond_donor_count", "h_bond_donor_count"),
    ("hbond_acceptor_count", "h_bond_acceptor_count"),
    ("rotatable_bonds", "rotatable_bond_count"),
    ("rotatablebond", "rotatable_bond_count"),
    ("in_ch_i", "inchi"),
    ("in_ch_i_key", "inchi_key"),
    ("weight", "molecular_weight"),
    ("formula", "molecular_formula"),
    ("cas_number", "cas"),
];

/// One or more property names were not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported properties: {}", names.join(", "))]
pub struct UnsupportedProperties {
    /// Every unrecognised name, in request order.
    pub names: Vec<String>,
}

/// Lower-cases and removes `_`, `-` and spaces.
fn flatten(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Looks up a catalog entry by any accepted spelling.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static PropertySpec> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(spec) = CATALOG.iter().find(|spec| spec.name == trimmed) {
        return Some(spec);
    }

    let flat = flatten(trimmed);
    if let Some((_, target)) = EXTRA_ALIASES
        .iter()
        .find(|(alias, _)| flatten(alias) == flat)
    {
        return CATALOG.iter().find(|spec| spec.name == *target);
    }

    CATALOG.iter().find(|spec| {
        flatten(spec.name) == flat || spec.tags().iter().any(|tag| flatten(tag) == flat)
    })
}

/// Names of the core property group, in catalog order.
#[must_use]
pub fn core_names() -> Vec<&'static str> {
    CATALOG.iter().filter(|s| s.core).map(|s| s.name).collect()
}

/// Names of the 3D descriptor group, in catalog order.
#[must_use]
pub fn three_d_names() -> Vec<&'static str> {
    CATALOG.iter().filter(|s| s.is_3d()).map(|s| s.name).collect()
}

/// Every catalog name.
#[must_use]
pub fn all_names() -> Vec<&'static str> {
    CATALOG.iter().map(|s| s.name).collect()
}

/// Expands the group names `core`, `3d` and `all`; other names pass through.
#[must_use]
pub fn expand_groups<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut expanded = Vec::new();
    for name in names {
        let name = name.as_ref().trim();
        match name.to_ascii_lowercase().as_str() {
            "core" => expanded.extend(core_names().into_iter().map(String::from)),
            "3d" => expanded.extend(three_d_names().into_iter().map(String::from)),
            "all" => expanded.extend(all_names().into_iter().map(String::from)),
            _ => expanded.push(name.to_string()),
        }
    }
    expanded
}

/// A validated, de-duplicated, ordered set of requested properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySelection {
    specs: Vec<&'static PropertySpec>,
}

impl PropertySelection {
    /// Resolves requested names against the catalog.
    ///
    /// Order follows the request; repeated or aliased duplicates are kept once.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedProperties`] listing every unknown name. Nothing
    /// is resolved partially.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, UnsupportedProperties> {
        let mut specs: Vec<&'static PropertySpec> = Vec::new();
        let mut unknown = Vec::new();

        for name in names {
            match lookup(name.as_ref()) {
                Some(spec) => {
                    if !specs.iter().any(|s| s.name == spec.name) {
                        specs.push(spec);
                    }
                }
                None => unknown.push(name.as_ref().to_string()),
            }
        }

        if unknown.is_empty() {
            Ok(Self { specs })
        } else {
            Err(UnsupportedProperties { names: unknown })
        }
    }

    /// Every catalog property.
    #[must_use]
    pub fn all() -> Self {
        Self {
            specs: CATALOG.iter().collect(),
        }
    }

    /// Selected entries in request order.
    #[must_use]
    pub fn specs(&self) -> &[&'static PropertySpec] {
        &self.specs
    }

    /// Canonical names in request order (the table's property columns).
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.specs.iter().map(|s| s.name).collect()
    }

    /// True when nothing was requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// De-duplicated property-table tags across all selected properties,
    /// including fallback tags, in first-seen order.
    #[must_use]
    pub fn tags(&self) -> Vec<&'static str> {
        let mut seen = HashSet::new();
        self.specs
            .iter()
            .flat_map(|s| s.tags().iter().copied())
            .filter(|tag| seen.insert(*tag))
            .collect()
    }

    /// Tags to request from the batch endpoint; falls back to the existence
    /// probe when only special properties (or nothing) were selected.
    #[must_use]
    pub fn batch_tags(&self) -> Vec<&'static str> {
        let tags = self.tags();
        if tags.is_empty() {
            vec![EXISTENCE_PROBE_TAG]
        } else {
            tags
        }
    }

    /// Special lookups required by the selection.
    #[must_use]
    pub fn specials(&self) -> Vec<Special> {
        self.specs.iter().filter_map(|s| s.special()).collect()
    }
}
