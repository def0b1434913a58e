//! Typed parameter table for component settings
//!
//! Every parameter id maps to one [`ParamSpec`] describing the value shape it
//! accepts, so a mismatched value is rejected before it reaches a device.

use std::collections::HashMap;
use std::fmt;

use crate::runtime::Rational;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamId {
    Brightness,
    Contrast,
    Saturation,
    Sharpness,
    Iso,
    ExposureCompensation,
    ShutterSpeed,
    ExposureMode,
    AwbMode,
    Rotation,
    HorizontalFlip,
    VerticalFlip,
    Framerate,
    Bitrate,
    Quality,
    CaptureEnabled,
}

/// Shape of the values a parameter accepts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    Bool,
    Int32 { min: i32, max: i32 },
    UInt32 { min: u32, max: u32 },
    Rational { min: f64, max: f64 },
    Enum(&'static [&'static str]),
}

impl ParamKind {
    fn name(&self) -> &'static str {
        match self {
            ParamKind::Bool => "bool",
            ParamKind::Int32 { .. } => "int32",
            ParamKind::UInt32 { .. } => "uint32",
            ParamKind::Rational { .. } => "rational",
            ParamKind::Enum(_) => "enum",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Rational(Rational),
    Enum(String),
}

impl ParamValue {
    fn kind_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int32(_) => "int32",
            ParamValue::UInt32(_) => "uint32",
            ParamValue::Rational(_) => "rational",
            ParamValue::Enum(_) => "enum",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int32(v) => write!(f, "{}", v),
            ParamValue::UInt32(v) => write!(f, "{}", v),
            ParamValue::Rational(r) => write!(f, "{}/{}", r.num, r.den),
            ParamValue::Enum(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub id: ParamId,
    pub name: &'static str,
    pub kind: ParamKind,
    pub writable: bool,
}

const EXPOSURE_MODES: &[&str] = &["off", "auto", "night", "backlight", "sports", "fixedfps"];
const AWB_MODES: &[&str] = &["off", "auto", "sunlight", "cloudy", "shade", "tungsten", "fluorescent"];

const fn spec(id: ParamId, name: &'static str, kind: ParamKind) -> ParamSpec {
    ParamSpec {
        id,
        name,
        kind,
        writable: true,
    }
}

static PARAMS: &[ParamSpec] = &[
    spec(ParamId::Brightness, "brightness", ParamKind::Rational { min: 0.0, max: 1.0 }),
    spec(ParamId::Contrast, "contrast", ParamKind::Rational { min: -1.0, max: 1.0 }),
    spec(ParamId::Saturation, "saturation", ParamKind::Rational { min: -1.0, max: 1.0 }),
    spec(ParamId::Sharpness, "sharpness", ParamKind::Rational { min: -1.0, max: 1.0 }),
    spec(ParamId::Iso, "iso", ParamKind::UInt32 { min: 0, max: 1600 }),
    spec(ParamId::ExposureCompensation, "exposure_compensation", ParamKind::Int32 { min: -10, max: 10 }),
    spec(ParamId::ShutterSpeed, "shutter_speed", ParamKind::UInt32 { min: 0, max: 6_000_000 }),
    spec(ParamId::ExposureMode, "exposure_mode", ParamKind::Enum(EXPOSURE_MODES)),
    spec(ParamId::AwbMode, "awb_mode", ParamKind::Enum(AWB_MODES)),
    spec(ParamId::Rotation, "rotation", ParamKind::Int32 { min: 0, max: 359 }),
    spec(ParamId::HorizontalFlip, "hflip", ParamKind::Bool),
    spec(ParamId::VerticalFlip, "vflip", ParamKind::Bool),
    spec(ParamId::Framerate, "framerate", ParamKind::Rational { min: 0.0, max: 120.0 }),
    spec(ParamId::Bitrate, "bitrate", ParamKind::UInt32 { min: 0, max: 25_000_000 }),
    spec(ParamId::Quality, "quality", ParamKind::UInt32 { min: 1, max: 100 }),
    ParamSpec {
        id: ParamId::CaptureEnabled,
        name: "capture",
        kind: ParamKind::Bool,
        writable: false,
    },
];

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("Parameter {0:?} is not supported")]
    Unsupported(ParamId),

    #[error("Parameter '{name}' expects {expected}, got {found}")]
    TypeMismatch {
        name: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Value {value} is out of range for parameter '{name}'")]
    OutOfRange { name: &'static str, value: String },

    #[error("Parameter '{0}' is read-only")]
    ReadOnly(&'static str),
}

/// Look up the table entry for `id`
pub fn param_spec(id: ParamId) -> Result<&'static ParamSpec, ParamError> {
    PARAMS
        .iter()
        .find(|spec| spec.id == id)
        .ok_or(ParamError::Unsupported(id))
}

/// Check `value` against the shape registered for `id`
pub fn validate(id: ParamId, value: &ParamValue) -> Result<(), ParamError> {
    let spec = param_spec(id)?;
    let out_of_range = || ParamError::OutOfRange {
        name: spec.name,
        value: value.to_string(),
    };
    match (&spec.kind, value) {
        (ParamKind::Bool, ParamValue::Bool(_)) => Ok(()),
        (ParamKind::Int32 { min, max }, ParamValue::Int32(v)) => {
            (min..=max).contains(&v).then_some(()).ok_or_else(out_of_range)
        }
        (ParamKind::UInt32 { min, max }, ParamValue::UInt32(v)) => {
            (min..=max).contains(&v).then_some(()).ok_or_else(out_of_range)
        }
        (ParamKind::Rational { min, max }, ParamValue::Rational(r)) => match r.as_f64() {
            Some(v) if (*min..=*max).contains(&v) => Ok(()),
            _ => Err(out_of_range()),
        },
        (ParamKind::Enum(options), ParamValue::Enum(v)) => options
            .iter()
            .any(|option| *option == v.as_str())
            .then_some(())
            .ok_or_else(out_of_range),
        (kind, value) => Err(ParamError::TypeMismatch {
            name: spec.name,
            expected: kind.name(),
            found: value.kind_name(),
        }),
    }
}

/// Device or parameter layer consulted before ports are enabled
pub trait ParameterStore: Send {
    fn get_parameter(&self, id: ParamId) -> Result<ParamValue, ParamError>;
    fn set_parameter(&mut self, id: ParamId, value: ParamValue) -> Result<(), ParamError>;
}

/// In-memory store validating every write against the table
#[derive(Debug, Clone, Default)]
pub struct MemoryParameters {
    values: HashMap<ParamId, ParamValue>,
}

impl MemoryParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value, bypassing the read-only check
    pub fn with_value(mut self, id: ParamId, value: ParamValue) -> Self {
        self.values.insert(id, value);
        self
    }
}

impl ParameterStore for MemoryParameters {
    fn get_parameter(&self, id: ParamId) -> Result<ParamValue, ParamError> {
        param_spec(id)?;
        self.values
            .get(&id)
            .cloned()
            .ok_or(ParamError::Unsupported(id))
    }

    fn set_parameter(&mut self, id: ParamId, value: ParamValue) -> Result<(), ParamError> {
        let spec = param_spec(id)?;
        if !spec.writable {
            return Err(ParamError::ReadOnly(spec.name));
        }
        validate(id, &value)?;
        self.values.insert(id, value);
        Ok(())
    }
}
