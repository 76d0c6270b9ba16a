//! Command option flags and their stable serialization.

use anyhow::{anyhow, Result};

/// The closed set of flags operations query to vary behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opt {
    /// Skip (with an acceptable error) if the destination already exists.
    IfNotExists,
    /// Remove the source after a successful copy/upload/download.
    DeleteSource,
    /// Preserve the source sub-path relative to the glob's fixed prefix.
    Parents,
    /// Descend into directories matched by a local glob.
    Recursive,
    /// Write remote objects with the Reduced-Redundancy storage class.
    ReducedRedundancy,
    /// Write remote objects with the Standard-IA storage class.
    StandardIa,
}

/// Canonical ordering, used so serialized flag suffixes are stable.
const ALL_OPTS: [Opt; 6] = [
    Opt::IfNotExists,
    Opt::DeleteSource,
    Opt::Parents,
    Opt::Recursive,
    Opt::ReducedRedundancy,
    Opt::StandardIa,
];

impl Opt {
    /// The command-line flag this option prints as, if it has one.
    /// `DeleteSource` has none: it is encoded by the `cp` -> `mv` rename.
    pub fn flag(self) -> Option<&'static str> {
        match self {
            Opt::IfNotExists => Some("-n"),
            Opt::DeleteSource => None,
            Opt::Parents => Some("--parents"),
            Opt::Recursive => Some("-R"),
            Opt::ReducedRedundancy => Some("-rr"),
            Opt::StandardIa => Some("-ia"),
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        ALL_OPTS
            .iter()
            .copied()
            .find(|o| o.flag() == Some(flag))
    }
}

/// A small set of [`Opt`] values. Queries are pure; insertion dedupes.
/// Equality is set equality, independent of insertion order.
#[derive(Debug, Clone, Default)]
pub struct OptionList(Vec<Opt>);

impl PartialEq for OptionList {
    fn eq(&self, other: &Self) -> bool {
        self.0.iter().all(|o| other.has(*o)) && other.0.iter().all(|o| self.has(*o))
    }
}

impl Eq for OptionList {}

impl OptionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, opt: Opt) -> bool {
        self.0.contains(&opt)
    }

    pub fn insert(&mut self, opt: Opt) {
        if !self.has(opt) {
            self.0.push(opt);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders the set as a stable flag suffix, e.g. `" -n --parents"`.
    /// Used when a batch job names its sub-command in human output.
    pub fn params(&self) -> String {
        let mut out = String::new();
        for opt in ALL_OPTS {
            if self.has(opt) {
                if let Some(flag) = opt.flag() {
                    out.push(' ');
                    out.push_str(flag);
                }
            }
        }
        out
    }
}

impl FromIterator<Opt> for OptionList {
    fn from_iter<I: IntoIterator<Item = Opt>>(iter: I) -> Self {
        let mut list = OptionList::new();
        for opt in iter {
            list.insert(opt);
        }
        list
    }
}

/// Parses a sub-command string as printed by a batch operation
/// (`"cp"`/`"mv"` plus serialized flags) back into its base command and
/// option set. `mv` implies `DeleteSource`.
pub fn parse_sub_command(s: &str) -> Result<(String, OptionList)> {
    let mut words = s.split_whitespace();
    let base = words
        .next()
        .ok_or_else(|| anyhow!("empty sub-command"))?
        .to_string();
    let mut opts = OptionList::new();
    if base == "mv" {
        opts.insert(Opt::DeleteSource);
    }
    for word in words {
        let opt = Opt::from_flag(word)
            .ok_or_else(|| anyhow!("unknown flag in sub-command {:?}: {}", s, word))?;
        opts.insert(opt);
    }
    Ok((base, opts))
}
