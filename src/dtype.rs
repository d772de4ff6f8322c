use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element types a convolution sweep can move through a kernel.
///
/// Inputs are either `I8` or `F32`; `I32` only appears as the promoted
/// accumulator type of an `I8` convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    I8,
    I32,
    F32,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I8 => 1,
            DType::I32 | DType::F32 => 4,
        }
    }

    /// Output type of a convolution whose operands have this type.
    ///
    /// Narrow integers widen to a 32-bit accumulator, floating types keep
    /// their width.
    pub fn accumulator(self) -> DType {
        match self {
            DType::I8 => DType::I32,
            other => other,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    /// C spelling used by the renderer.
    pub fn c_type(self) -> &'static str {
        match self {
            DType::I8 => "signed char",
            DType::I32 => "int",
            DType::F32 => "float",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::I8 => "int8",
            DType::I32 => "int32",
            DType::F32 => "float32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dtype '{0}' (expected int8, int32, float or float32)")]
pub struct UnknownDType(pub String);

impl FromStr for DType {
    type Err = UnknownDType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int8" | "i8" => Ok(DType::I8),
            "int32" | "i32" => Ok(DType::I32),
            "float" | "float32" | "f32" => Ok(DType::F32),
            other => Err(UnknownDType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_promotion() {
        assert_eq!(DType::I8.accumulator(), DType::I32);
        assert_eq!(DType::F32.accumulator(), DType::F32);
        assert_eq!(DType::I32.accumulator(), DType::I32);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("float".parse::<DType>().unwrap(), DType::F32);
        assert_eq!("float32".parse::<DType>().unwrap(), DType::F32);
        assert_eq!("int8".parse::<DType>().unwrap(), DType::I8);
        assert!("bfloat16".parse::<DType>().is_err());
    }

    #[test]
    fn test_c_type() {
        assert_eq!(DType::I8.c_type(), "signed char");
        assert_eq!(DType::I32.size_in_bytes(), 4);
    }
}
