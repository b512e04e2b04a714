//! Projection of the authoring tool's step payload onto [`Step`].
//!
//! The method editor stores every step as a flat map keyed by widget name: one boolean
//! per radio button or checkbox, one number per spin box. This is the only place those
//! names appear; the engine works exclusively with the typed `Step`.
//!
//! Numbers may arrive as JSON numbers or as strings (the editor writes what the widget
//! holds), booleans as JSON booleans or `"true"`/`"false"` strings.

use serde_json::{Map, Value};

use super::{
    Assist, InjectDrive, Method, Polarity, RinseDirection, RinseDrive, SeparationDrive,
    SingleCellMode, Step, StepAction, StepCommon,
};
use crate::error::{AppResult, DaqError};

const TYPE: &str = "Type";
const INLET_WELL: &str = "InletWell";
const OUTLET_WELL: &str = "OutletWell";
const INLET_TRAVEL: &str = "InletTravel";
const OUTLET_TRAVEL: &str = "OutletTravel";
const INCREMENT_EVERY: &str = "IncrementEvery";
const SUMMARY: &str = "Summary";

const SEP_VOLTAGE: &str = "SeparationTypeVoltageRadio";
const SEP_CURRENT: &str = "SeparationTypeCurrentRadio";
const SEP_POWER: &str = "SeparationTypePowerRadio";
const SEP_PRESSURE: &str = "SeparationTypePressureRadio";
const SEP_VACUUM: &str = "SeparationTypeVacuumRadio";
const SEP_ASSIST_PRESSURE: &str = "SeparationAssistPressureCheck";
const SEP_ASSIST_VACUUM: &str = "SeparationAssistVacuumCheck";
const SEP_REVERSE: &str = "SeparationReversePolarityCheck";
const SEP_VOLTAGE_VALUE: &str = "SeparationVoltageValue";
const SEP_DURATION: &str = "SeparationDurationValue";
const SEP_RAMP: &str = "SeparationRampValue";

const RINSE_PRESSURE: &str = "RinseTypePressureRadio";
const RINSE_VACUUM: &str = "RinseTypeVacuumRadio";
const RINSE_REVERSE: &str = "RinseReverseRadio";
const RINSE_DURATION: &str = "RinseDurationValue";

const INJ_VOLTAGE: &str = "InjectionTypeVoltageRadio";
const INJ_PRESSURE: &str = "InjectionTypePressureRadio";
const INJ_VACUUM: &str = "InjectionTypeVacuumRadio";
const INJ_VOLTAGE_VALUE: &str = "InjectionVoltageValue";
const INJ_DURATION: &str = "InjectionDurationValue";
const SINGLE_CELL_AUTO: &str = "SingleCellAutoRadio";
const SINGLE_CELL_MANUAL: &str = "SingleCellManualRadio";
const ALLOW_OVERRIDE: &str = "AllowOverrideCheck";

/// Build a method from a JSON array of step payloads.
pub fn method_from_payload(value: &Value) -> AppResult<Method> {
    let items = value
        .as_array()
        .ok_or_else(|| DaqError::Payload("method must be a JSON array of steps".to_string()))?;

    let steps = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let map = item
                .as_object()
                .ok_or_else(|| DaqError::Payload(format!("step {i} is not an object")))?;
            step_from_payload(map).map_err(|e| DaqError::Payload(format!("step {i}: {e}")))
        })
        .collect::<AppResult<Vec<_>>>()?;

    Ok(Method::new(steps))
}

/// Project one step payload onto a typed step.
///
/// A step whose drive radio buttons are all unset becomes [`StepAction::Unconfigured`];
/// two drive radios set at once is a payload error.
pub fn step_from_payload(map: &Map<String, Value>) -> AppResult<Step> {
    let common = StepCommon {
        inlet_well: text(map, INLET_WELL),
        outlet_well: text(map, OUTLET_WELL),
        inlet_travel_mm: number(map, INLET_TRAVEL)?.unwrap_or(0.0),
        outlet_travel_cm: number(map, OUTLET_TRAVEL)?.unwrap_or(0.0),
        increment_every_n_cycles: increment(map)?,
        summary: text(map, SUMMARY),
    };

    let action = match text(map, TYPE).to_lowercase().as_str() {
        "separate" | "separation" => separate_action(map)?,
        "rinse" => rinse_action(map)?,
        "inject" | "injection" => inject_action(map)?,
        "" => StepAction::Unconfigured,
        other => return Err(DaqError::Payload(format!("unknown step type '{other}'"))),
    };

    Ok(Step { common, action })
}

fn separate_action(map: &Map<String, Value>) -> AppResult<StepAction> {
    let drive = match selected(
        map,
        &[SEP_VOLTAGE, SEP_CURRENT, SEP_POWER, SEP_PRESSURE, SEP_VACUUM],
    )? {
        None => return Ok(StepAction::Unconfigured),
        Some(SEP_VOLTAGE) => SeparationDrive::Voltage(required(map, SEP_VOLTAGE_VALUE)?),
        Some(SEP_CURRENT) => SeparationDrive::Current,
        Some(SEP_POWER) => SeparationDrive::Power,
        Some(SEP_PRESSURE) => SeparationDrive::Pressure,
        Some(_) => SeparationDrive::Vacuum,
    };

    // The assist checkboxes are independent; the engine decides what it can drive.
    let assist = match (flag(map, SEP_ASSIST_PRESSURE), flag(map, SEP_ASSIST_VACUUM)) {
        (false, false) => Assist::None,
        (true, false) => Assist::Pressure,
        (false, true) => Assist::Vacuum,
        (true, true) => Assist::Both,
    };

    let polarity = if flag(map, SEP_REVERSE) {
        Polarity::Reverse
    } else {
        Polarity::Normal
    };

    Ok(StepAction::Separate {
        drive,
        assist,
        polarity,
        duration_s: required(map, SEP_DURATION)?,
        ramp_time_s: number(map, SEP_RAMP)?.unwrap_or(0.0),
    })
}

fn rinse_action(map: &Map<String, Value>) -> AppResult<StepAction> {
    let drive = match selected(map, &[RINSE_PRESSURE, RINSE_VACUUM])? {
        None => return Ok(StepAction::Unconfigured),
        Some(RINSE_PRESSURE) => RinseDrive::Pressure,
        Some(_) => RinseDrive::Vacuum,
    };
    let direction = if flag(map, RINSE_REVERSE) {
        RinseDirection::Reverse
    } else {
        RinseDirection::Forward
    };
    Ok(StepAction::Rinse {
        drive,
        direction,
        duration_s: required(map, RINSE_DURATION)?,
    })
}

fn inject_action(map: &Map<String, Value>) -> AppResult<StepAction> {
    let drive = match selected(map, &[INJ_VOLTAGE, INJ_PRESSURE, INJ_VACUUM])? {
        None => return Ok(StepAction::Unconfigured),
        Some(INJ_VOLTAGE) => InjectDrive::Voltage(required(map, INJ_VOLTAGE_VALUE)?),
        Some(INJ_PRESSURE) => InjectDrive::Pressure,
        Some(_) => InjectDrive::Vacuum,
    };
    let single_cell = match selected(map, &[SINGLE_CELL_AUTO, SINGLE_CELL_MANUAL])? {
        None => None,
        Some(SINGLE_CELL_AUTO) => Some(SingleCellMode::Auto),
        Some(_) => Some(SingleCellMode::Manual),
    };
    Ok(StepAction::Inject {
        drive,
        duration_s: required(map, INJ_DURATION)?,
        single_cell,
        allow_override: flag(map, ALLOW_OVERRIDE),
    })
}

/// The single key among `keys` whose flag is set.
fn selected(map: &Map<String, Value>, keys: &[&'static str]) -> AppResult<Option<&'static str>> {
    let set: Vec<&'static str> = keys.iter().copied().filter(|k| flag(map, k)).collect();
    match set.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some(*one)),
        many => Err(DaqError::Payload(format!(
            "mutually exclusive options set together: {}",
            many.join(", ")
        ))),
    }
}

fn flag(map: &Map<String, Value>, key: &str) -> bool {
    match map.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}

fn text(map: &Map<String, Value>, key: &str) -> String {
    match map.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn number(map: &Map<String, Value>, key: &str) -> AppResult<Option<f64>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| DaqError::Payload(format!("'{key}' is not a number: '{s}'"))),
        Some(other) => Err(DaqError::Payload(format!(
            "'{key}' is not a number: {other}"
        ))),
    }
}

fn required(map: &Map<String, Value>, key: &str) -> AppResult<f64> {
    number(map, key)?.ok_or_else(|| DaqError::Payload(format!("missing '{key}'")))
}

fn increment(map: &Map<String, Value>) -> AppResult<Option<u32>> {
    match number(map, INCREMENT_EVERY)? {
        None => Ok(None),
        Some(n) if n < 1.0 => Ok(None),
        Some(n) if n.fract() == 0.0 && n <= f64::from(u32::MAX) => Ok(Some(n as u32)),
        Some(n) => Err(DaqError::Payload(format!(
            "'{INCREMENT_EVERY}' must be a whole number, got {n}"
        ))),
    }
}
