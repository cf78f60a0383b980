//! Chip generation classification from the CPU brand string.

use std::fmt;

use serde::Serialize;

use crate::smc::SmcKey;

const KEY_CPU_DIE_INTEL: SmcKey = SmcKey::from_bytes(*b"TC0D");
const KEY_CPU_DIE_M3: SmcKey = SmcKey::from_bytes(*b"Tf04");
const KEY_CPU_DIE_APPLE: SmcKey = SmcKey::from_bytes(*b"Tp01");

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ChipGeneration {
    Intel,
    M1,
    M2,
    M3,
    M4,
    M5,
    Unknown,
}

impl ChipGeneration {
    /// Apple silicon generations, newest first. Classification takes the first one whose name
    /// appears in the brand string.
    pub const APPLE_SILICON: [ChipGeneration; 5] = [Self::M5, Self::M4, Self::M3, Self::M2, Self::M1];

    /// The single key that holds the CPU die temperature on this generation.
    pub const fn cpu_die_key(self) -> SmcKey {
        match self {
            Self::M3 => KEY_CPU_DIE_M3,
            Self::M1 | Self::M2 | Self::M4 | Self::M5 => KEY_CPU_DIE_APPLE,
            Self::Intel | Self::Unknown => KEY_CPU_DIE_INTEL,
        }
    }
}

impl fmt::Display for ChipGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Intel => "Intel",
            Self::M1 => "M1",
            Self::M2 => "M2",
            Self::M3 => "M3",
            Self::M4 => "M4",
            Self::M5 => "M5",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ChipTier {
    Base,
    Pro,
    Max,
    Ultra,
}

impl ChipTier {
    fn from_brand(brand: &str) -> Self {
        let has = |word: &str| brand.split_whitespace().any(|w| w == word);
        if has("Ultra") {
            Self::Ultra
        } else if has("Max") {
            Self::Max
        } else if has("Pro") {
            Self::Pro
        } else {
            Self::Base
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Base => "",
            Self::Pro => " Pro",
            Self::Max => " Max",
            Self::Ultra => " Ultra",
        }
    }
}

/// How much the brand string backs up the classified generation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Confidence {
    /// The brand string named the generation.
    Confirmed,
    /// The brand string was unavailable or did not look like Apple silicon; Intel was assumed.
    Fallback,
    /// Apple silicon with no recognised generation; M1 keys are used.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub generation: ChipGeneration,
    pub tier: ChipTier,
    pub confidence: Confidence,
    pub brand: Option<String>,
}

impl Classification {
    /// A display name such as `"Apple M3 Pro"` or `"Intel"`.
    pub fn model_name(&self) -> String {
        match (self.generation, self.confidence) {
            (ChipGeneration::Intel, _) => "Intel".to_string(),
            (ChipGeneration::Unknown, _) => "Unknown".to_string(),
            (_, Confidence::BestEffort) => self
                .brand
                .as_deref()
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .unwrap_or("Unknown")
                .to_string(),
            (generation, _) => format!("Apple {}{}", generation, self.tier.suffix()),
        }
    }
}

/// Classifies a CPU brand string. `None` means the brand string could not be read.
pub fn classify(brand: Option<&str>) -> Classification {
    let intel = |confidence| Classification {
        generation: ChipGeneration::Intel,
        tier: ChipTier::Base,
        confidence,
        brand: brand.map(str::to_string),
    };

    let Some(text) = brand else {
        return intel(Confidence::Fallback);
    };
    if text.contains("Intel") {
        return intel(Confidence::Confirmed);
    }
    if !text.contains("Apple") {
        return intel(Confidence::Fallback);
    }

    let (generation, confidence) = ChipGeneration::APPLE_SILICON
        .into_iter()
        .find(|g| text.contains(&g.to_string()))
        .map_or((ChipGeneration::M1, Confidence::BestEffort), |g| {
            (g, Confidence::Confirmed)
        });

    Classification {
        generation,
        tier: ChipTier::from_brand(text),
        confidence,
        brand: Some(text.to_string()),
    }
}

/// Source of the CPU brand string.
pub trait CpuIdentity {
    fn brand_string(&self) -> Option<String>;
}

/// A brand string known up front.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(pub Option<String>);

impl StaticIdentity {
    pub fn new(brand: &str) -> Self {
        Self(Some(brand.to_string()))
    }
}

impl CpuIdentity for StaticIdentity {
    fn brand_string(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads `machdep.cpu.brand_string` through sysctl.
#[cfg(target_os = "macos")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SysctlIdentity;

#[cfg(target_os = "macos")]
impl CpuIdentity for SysctlIdentity {
    fn brand_string(&self) -> Option<String> {
        match crate::utils::sysctl_string("machdep.cpu.brand_string") {
            Ok(brand) => Some(brand),
            Err(err) => {
                log::debug!("cpu brand string unavailable: {}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intel_brand_is_confirmed_intel() {
        let c = classify(Some("Intel(R) Core(TM) i9-9980HK CPU @ 2.40GHz"));
        assert_eq!(c.generation, ChipGeneration::Intel);
        assert_eq!(c.confidence, Confidence::Confirmed);
        assert_eq!(c.model_name(), "Intel");
    }

    #[test]
    fn unreadable_or_foreign_brand_falls_back_to_intel() {
        assert_eq!(classify(None).generation, ChipGeneration::Intel);
        assert_eq!(classify(None).confidence, Confidence::Fallback);

        let c = classify(Some("QEMU Virtual CPU version 2.5+"));
        assert_eq!(c.generation, ChipGeneration::Intel);
        assert_eq!(c.confidence, Confidence::Fallback);
    }

    #[test]
    fn apple_silicon_generations_and_tiers() {
        let c = classify(Some("Apple M3 Pro"));
        assert_eq!(c.generation, ChipGeneration::M3);
        assert_eq!(c.tier, ChipTier::Pro);
        assert_eq!(c.confidence, Confidence::Confirmed);
        assert_eq!(c.model_name(), "Apple M3 Pro");

        assert_eq!(classify(Some("Apple M1")).tier, ChipTier::Base);
        assert_eq!(classify(Some("Apple M2 Max")).model_name(), "Apple M2 Max");
        assert_eq!(classify(Some("Apple M1 Ultra")).tier, ChipTier::Ultra);
        assert_eq!(classify(Some("Apple M5")).generation, ChipGeneration::M5);
    }

    #[test]
    fn unrecognised_apple_silicon_is_best_effort_m1() {
        let c = classify(Some("Apple A18 Pro"));
        assert_eq!(c.generation, ChipGeneration::M1);
        assert_eq!(c.confidence, Confidence::BestEffort);
        assert_eq!(c.model_name(), "Apple A18 Pro");
        assert_ne!(c, classify(Some("Apple M1")));
    }

    #[test]
    fn cpu_die_key_per_generation() {
        assert_eq!(ChipGeneration::Intel.cpu_die_key().to_string(), "TC0D");
        assert_eq!(ChipGeneration::M3.cpu_die_key().to_string(), "Tf04");
        assert_eq!(ChipGeneration::M4.cpu_die_key().to_string(), "Tp01");
        assert_eq!(ChipGeneration::M5.cpu_die_key().to_string(), "Tp01");
        assert_eq!(ChipGeneration::Unknown.cpu_die_key().to_string(), "TC0D");
    }
}
