//! Transport tiers, ordered best first.

use crate::surface::SurfaceConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// How the interop tier attached the shared resource to the producer's framebuffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InteropAttachment {
    Texture,
    Renderbuffer,
}

impl InteropAttachment {
    /// Attempt order within one relaxation rung.
    pub const ORDER: [InteropAttachment; 2] = [InteropAttachment::Texture, InteropAttachment::Renderbuffer];
}

/// The tier a session moves frames with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportCapability {
    /// Platform shared surfaces. Zero copy.
    NativeSharedMemory,
    /// A foreign API's texture registered with the producer. Zero copy.
    CrossApiInterop(InteropAttachment),
    /// Readback into a CPU buffer.
    CpuMediated,
}

impl TransportCapability {
    pub fn tier(&self) -> Tier {
        match self {
            TransportCapability::NativeSharedMemory => Tier::NativeSharedMemory,
            TransportCapability::CrossApiInterop(_) => Tier::CrossApiInterop,
            TransportCapability::CpuMediated => Tier::CpuMediated,
        }
    }

    pub fn is_zero_copy(&self) -> bool {
        !matches!(self, TransportCapability::CpuMediated)
    }
}

impl Display for TransportCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportCapability::NativeSharedMemory => write!(f, "NativeSharedMemory"),
            TransportCapability::CrossApiInterop(InteropAttachment::Texture) => write!(f, "CrossApiInterop(texture)"),
            TransportCapability::CrossApiInterop(InteropAttachment::Renderbuffer) => {
                write!(f, "CrossApiInterop(renderbuffer)")
            }
            TransportCapability::CpuMediated => write!(f, "CpuMediated"),
        }
    }
}

/// A tier without its sub-state. Orders best (smallest) to worst, and is used
/// as the negotiation ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    #[default]
    #[serde(alias = "native")]
    NativeSharedMemory,
    #[serde(alias = "interop")]
    CrossApiInterop,
    #[serde(alias = "cpu")]
    CpuMediated,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::NativeSharedMemory, Tier::CrossApiInterop, Tier::CpuMediated];

    /// The next tier down, if any.
    pub fn below(&self) -> Option<Tier> {
        match self {
            Tier::NativeSharedMemory => Some(Tier::CrossApiInterop),
            Tier::CrossApiInterop => Some(Tier::CpuMediated),
            Tier::CpuMediated => None,
        }
    }

    /// Parses the short names used in environment overrides.
    pub fn parse(s: &str) -> Option<Tier> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "native-shared-memory" => Some(Tier::NativeSharedMemory),
            "interop" | "cross-api-interop" => Some(Tier::CrossApiInterop),
            "cpu" | "cpu-mediated" => Some(Tier::CpuMediated),
            _ => None,
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::NativeSharedMemory => write!(f, "native"),
            Tier::CrossApiInterop => write!(f, "interop"),
            Tier::CpuMediated => write!(f, "cpu"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Selected,
    Unavailable(String),
    AdapterMismatch { producer: String, host: String },
    Failed(String),
}

/// One probe made during negotiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiationAttempt {
    pub tier: Tier,
    pub config: Option<SurfaceConfig>,
    pub attachment: Option<InteropAttachment>,
    pub outcome: AttemptOutcome,
}

impl Display for NegotiationAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tier)?;
        if let Some(config) = self.config {
            write!(f, "/{config}")?;
        }
        if let Some(attachment) = self.attachment {
            write!(f, "/{attachment:?}")?;
        }
        match &self.outcome {
            AttemptOutcome::Selected => write!(f, ": selected"),
            AttemptOutcome::Unavailable(why) => write!(f, ": unavailable ({why})"),
            AttemptOutcome::AdapterMismatch { producer, host } => {
                write!(f, ": adapter mismatch (producer {producer}, host {host})")
            }
            AttemptOutcome::Failed(why) => write!(f, ": failed ({why})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_order_best_first() {
        assert!(Tier::NativeSharedMemory < Tier::CrossApiInterop);
        assert!(Tier::CrossApiInterop < Tier::CpuMediated);
        assert_eq!(Tier::NativeSharedMemory.below(), Some(Tier::CrossApiInterop));
        assert_eq!(Tier::CpuMediated.below(), None);
    }

    #[test]
    fn capability_tier_and_display() {
        let cap = TransportCapability::CrossApiInterop(InteropAttachment::Renderbuffer);
        assert_eq!(cap.tier(), Tier::CrossApiInterop);
        assert!(cap.is_zero_copy());
        assert!(!TransportCapability::CpuMediated.is_zero_copy());
        assert_eq!(cap.to_string(), "CrossApiInterop(renderbuffer)");
    }

    #[test]
    fn parse_short_names() {
        assert_eq!(Tier::parse(" Interop "), Some(Tier::CrossApiInterop));
        assert_eq!(Tier::parse("cpu"), Some(Tier::CpuMediated));
        assert_eq!(Tier::parse("gpu"), None);
    }

    #[test]
    fn tier_serde_names() {
        assert_eq!(serde_json::to_string(&Tier::CpuMediated).unwrap(), "\"cpu-mediated\"");
        let t: Tier = serde_json::from_str("\"interop\"").unwrap();
        assert_eq!(t, Tier::CrossApiInterop);
    }

    #[test]
    fn attempt_display() {
        let a = NegotiationAttempt {
            tier: Tier::CrossApiInterop,
            config: Some(SurfaceConfig::D16S8),
            attachment: Some(InteropAttachment::Texture),
            outcome: AttemptOutcome::Failed("incomplete".into()),
        };
        assert_eq!(a.to_string(), "interop/D16S8/Texture: failed (incomplete)");
    }
}
