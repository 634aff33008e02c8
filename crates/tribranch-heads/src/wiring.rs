//! Branch wiring compiled from the configuration flags.
//!
//! The flags are validated once into a [`Wiring`]; the router then follows
//! its fixed [`Stage`] plan on every call.

use std::fmt;

use serde::{Deserialize, Serialize};
use tribranch_core::{Error, Result};

use crate::config::BranchFlags;

/// How the overlapping and non-overlapping branches get their input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuidanceMode {
    /// Pooled features as they are
    Direct,
    /// Pooled features gated by the first whole pass's inner feature
    Attention,
    /// Pooled features fused with the first whole pass through conv stacks
    BranchGuidance,
}

/// Whether and how the final whole-mask branch runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefinementMode {
    /// No final pass; the guidance pass is the whole-mask output
    Off,
    /// Final pass on the pooled features only
    Pure,
    /// Final pass on pooled features fused with both partition branches
    Fused,
}

/// Partition consistency term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyMode {
    /// Whole mask vs overlapping XOR non-overlapping
    MaskXor,
}

impl ConsistencyMode {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "MX" => Ok(ConsistencyMode::MaskXor),
            other => Err(Error::Config(format!("unknown consistency mode `{other}`"))),
        }
    }
}

/// One step of a forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Box,
    WholePre,
    Overlap,
    NonOverlap,
    WholeFinal,
    Consistency,
}

/// Legal branch configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wiring {
    pub guidance: GuidanceMode,
    pub refinement: RefinementMode,
    pub consistency: Option<ConsistencyMode>,
    /// Class relabeled during proposal labeling
    pub filter_out_class: Option<i64>,
    /// Carried from the flags; unlabeled batches are detected from the
    /// targets alone
    pub semi_supervised: bool,
}

impl Wiring {
    pub fn from_flags(flags: &BranchFlags) -> Result<Self> {
        // branch_guidance wins over heads_attention
        let guidance = if flags.branch_guidance {
            GuidanceMode::BranchGuidance
        } else if flags.heads_attention {
            GuidanceMode::Attention
        } else {
            GuidanceMode::Direct
        };

        let refinement = match (flags.refinement, flags.pure_branch) {
            (false, _) if !flags.branch_guidance => {
                return Err(Error::Config(
                    "refinement cannot be off without branch_guidance".into(),
                ));
            }
            (false, _) => RefinementMode::Off,
            (true, true) => RefinementMode::Pure,
            (true, false) => RefinementMode::Fused,
        };

        let consistency = if flags.consistency_loss {
            Some(ConsistencyMode::parse(&flags.consistency_mode)?)
        } else {
            None
        };

        let filter_out_class = if flags.for_nuclei {
            Some(0)
        } else if flags.rpn_attention {
            Some(1)
        } else {
            None
        };

        Ok(Self {
            guidance,
            refinement,
            consistency,
            filter_out_class,
            semi_supervised: flags.semi_supervised,
        })
    }

    /// Whole branch runs before the partition branches
    pub fn has_whole_pre(&self) -> bool {
        self.guidance != GuidanceMode::Direct
    }

    /// Whole branch is called with its guiding layers at some stage
    pub fn whole_is_guided(&self) -> bool {
        self.refinement == RefinementMode::Fused
    }

    /// Whole branch is called on the bare pooled features at some stage
    pub fn whole_is_unguided(&self) -> bool {
        self.has_whole_pre() || self.refinement == RefinementMode::Pure
    }

    /// Stages of one forward pass, in order
    pub fn plan(&self) -> Vec<Stage> {
        let mut stages = vec![Stage::Box];
        if self.has_whole_pre() {
            stages.push(Stage::WholePre);
        }
        stages.push(Stage::Overlap);
        stages.push(Stage::NonOverlap);
        if self.refinement != RefinementMode::Off {
            stages.push(Stage::WholeFinal);
        }
        if self.consistency.is_some() {
            stages.push(Stage::Consistency);
        }
        stages
    }
}

impl fmt::Display for Wiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.guidance, self.refinement)?;
        if let Some(mode) = self.consistency {
            write!(f, "/{mode:?}")?;
        }
        Ok(())
    }
}
