//! Embedded kernel sources and their argument signatures.

/// How a kernel argument is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// `var<storage, read>`
    ReadOnly,
    /// `var<storage, read_write>`
    ReadWrite,
    /// `var<uniform>`
    Uniform,
}

/// One entry point and its binding signature, in binding order.
#[derive(Debug)]
pub struct KernelEntry {
    pub name: &'static str,
    pub args: &'static [ArgKind],
}

/// A program's source text plus the entry points it exports.
#[derive(Debug)]
pub struct KernelSource {
    pub program: &'static str,
    pub source: &'static str,
    pub entries: &'static [KernelEntry],
}

use ArgKind::{ReadOnly, ReadWrite, Uniform};

const UNARY: &[ArgKind] = &[ReadOnly, ReadWrite, Uniform];
const WEIGHTED: &[ArgKind] = &[ReadOnly, ReadOnly, ReadOnly, ReadWrite, Uniform];

static SOURCES: &[KernelSource] = &[
    KernelSource {
        program: "activation",
        source: include_str!("kernels/activation.wgsl"),
        entries: &[KernelEntry {
            name: "relu",
            args: UNARY,
        }],
    },
    KernelSource {
        program: "softmax",
        source: include_str!("kernels/softmax.wgsl"),
        entries: &[KernelEntry {
            name: "softmax",
            args: UNARY,
        }],
    },
    KernelSource {
        program: "inner_product",
        source: include_str!("kernels/inner_product.wgsl"),
        entries: &[KernelEntry {
            name: "inner_product",
            args: WEIGHTED,
        }],
    },
    KernelSource {
        program: "convolution",
        source: include_str!("kernels/convolution.wgsl"),
        entries: &[KernelEntry {
            name: "convolution",
            args: WEIGHTED,
        }],
    },
    KernelSource {
        program: "scale",
        source: include_str!("kernels/scale.wgsl"),
        entries: &[KernelEntry {
            name: "scale",
            args: WEIGHTED,
        }],
    },
    KernelSource {
        program: "pooling",
        source: include_str!("kernels/pooling.wgsl"),
        entries: &[KernelEntry {
            name: "pooling",
            args: UNARY,
        }],
    },
    KernelSource {
        program: "eltwise",
        source: include_str!("kernels/eltwise.wgsl"),
        entries: &[KernelEntry {
            name: "eltwise",
            args: &[ReadOnly, ReadOnly, ReadWrite, Uniform],
        }],
    },
];

/// Find the embedded source of `program`.
pub fn lookup(program: &str) -> Option<&'static KernelSource> {
    SOURCES.iter().find(|source| source.program == program)
}

/// Names of every embedded program.
pub fn programs() -> impl Iterator<Item = &'static str> {
    SOURCES.iter().map(|source| source.program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::program::declared_overrides;

    #[test]
    fn every_entry_is_defined_in_its_source() {
        for source in SOURCES {
            for entry in source.entries {
                assert!(
                    source.source.contains(&format!("fn {}(", entry.name)),
                    "{} does not define {}",
                    source.program,
                    entry.name
                );
                let bindings = source.source.matches("@binding(").count();
                assert_eq!(bindings, entry.args.len(), "{}", source.program);
            }
        }
    }

    #[test]
    fn every_source_declares_launch_overrides() {
        for source in SOURCES {
            let declared = declared_overrides(source.source);
            for name in ["WG_X", "WG_Y", "WG_Z", "N"] {
                assert!(declared.contains(name), "{} lacks {name}", source.program);
            }
        }
    }

    #[test]
    fn lookup_finds_known_programs_only() {
        assert!(lookup("convolution").is_some());
        assert!(lookup("deconvolution").is_none());
        assert_eq!(programs().count(), 7);
    }
}
