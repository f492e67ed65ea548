/*
 * This file is part of fan-service.
 *
 * Copyright (C) 2025 fan-service contributors
 *
 * fan-service is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * fan-service is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with fan-service. If not, see <https://www.gnu.org/licenses/>.
 */

//! Fan service configuration
//!
//! The config is a JSON document whose object keys are all resolved through a
//! fixed keyword dictionary. Anything the dictionary does not know, or a known
//! keyword used where it does not belong, is rejected as a config error.
//! Tables are ordered `(breakpoint, value)` lists; their order is preserved
//! because lookups pick the last breakpoint not above the input.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

use fan_error::{FanServiceError, Result};

use crate::constants::defaults;
use crate::sensor_data::OpticTableType;

/// Ordered `(breakpoint, value)` pairs
pub type Table = Vec<(f32, f32)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Keyword {
    Bsp,
    BspGeneric,
    BspDarwin,
    BspLassen,
    BspMinipack3,
    BspMokujin,
    PwmBoostValue,
    PwmTransitionValue,
    BoostOnDeadFan,
    BoostOnDeadSensor,
    BoostOnNoQsfpAfter,
    PwmUpper,
    PwmLower,
    Watchdog,
    WatchdogValue,
    ShutdownCommand,
    SensorFetchFrequency,
    ControlFrequency,
    Zones,
    ZoneType,
    ZoneTypeMax,
    ZoneTypeMin,
    ZoneTypeAvg,
    Slope,
    Fans,
    FanPwm,
    FanRpm,
    FanLed,
    FanPresence,
    FanPwmMin,
    FanPwmMax,
    FanPresentVal,
    FanMissingVal,
    FanFailLedVal,
    FanGoodLedVal,
    Source,
    SourceSysfs,
    SourceUtil,
    SourceThrift,
    SourceRest,
    Path,
    Sensors,
    Optics,
    Aggregation,
    Adjustment,
    Scale,
    Alarm,
    Access,
    AlarmMajor,
    AlarmMinor,
    AlarmMinorSoak,
    SensorType,
    FourCurves,
    IncrementPid,
    Pid,
    Disable,
    NormalUpTable,
    NormalDownTable,
    FailUpTable,
    FailDownTable,
    SetPoint,
    PosHysteresis,
    NegHysteresis,
    Kp,
    Ki,
    Kd,
    RangeCheck,
    RangeLow,
    RangeHigh,
    Tolerance,
    InvalidRangeAction,
    ActionShutdown,
    ActionNone,
    OpticTable(OpticTableType),
    Invalid,
}

lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, Keyword> = prepare_dict();
}

fn prepare_dict() -> HashMap<&'static str, Keyword> {
    let mut dict = HashMap::new();
    dict.insert("bsp", Keyword::Bsp);
    dict.insert("generic", Keyword::BspGeneric);
    dict.insert("darwin", Keyword::BspDarwin);
    dict.insert("lassen", Keyword::BspLassen);
    dict.insert("minipack3", Keyword::BspMinipack3);
    dict.insert("mokujin", Keyword::BspMokujin);
    dict.insert("pwm_boost_value", Keyword::PwmBoostValue);
    dict.insert("pwm_transition_value", Keyword::PwmTransitionValue);
    dict.insert("boost_on_dead_fan", Keyword::BoostOnDeadFan);
    dict.insert("boost_on_dead_sensor", Keyword::BoostOnDeadSensor);
    dict.insert("boost_on_no_qsfp_after", Keyword::BoostOnNoQsfpAfter);
    dict.insert("pwm_percent_upper_limit", Keyword::PwmUpper);
    dict.insert("pwm_percent_lower_limit", Keyword::PwmLower);
    dict.insert("watchdog", Keyword::Watchdog);
    dict.insert("value", Keyword::WatchdogValue);
    dict.insert("shutdown_command", Keyword::ShutdownCommand);
    dict.insert("sensor_fetch_frequency", Keyword::SensorFetchFrequency);
    dict.insert("control_frequency", Keyword::ControlFrequency);
    dict.insert("zones", Keyword::Zones);
    dict.insert("zone_type", Keyword::ZoneType);
    dict.insert("max", Keyword::ZoneTypeMax);
    dict.insert("min", Keyword::ZoneTypeMin);
    dict.insert("avg", Keyword::ZoneTypeAvg);
    dict.insert("slope", Keyword::Slope);
    dict.insert("fans", Keyword::Fans);
    dict.insert("pwm", Keyword::FanPwm);
    dict.insert("rpm", Keyword::FanRpm);
    dict.insert("led", Keyword::FanLed);
    dict.insert("presence", Keyword::FanPresence);
    dict.insert("pwm_min", Keyword::FanPwmMin);
    dict.insert("pwm_max", Keyword::FanPwmMax);
    dict.insert("fan_present_val", Keyword::FanPresentVal);
    dict.insert("fan_missing_val", Keyword::FanMissingVal);
    dict.insert("fan_fail_led_val", Keyword::FanFailLedVal);
    dict.insert("fan_good_led_val", Keyword::FanGoodLedVal);
    dict.insert("source", Keyword::Source);
    dict.insert("sysfs", Keyword::SourceSysfs);
    dict.insert("util", Keyword::SourceUtil);
    dict.insert("thrift", Keyword::SourceThrift);
    dict.insert("REST", Keyword::SourceRest);
    dict.insert("path", Keyword::Path);
    dict.insert("sensors", Keyword::Sensors);
    dict.insert("optics", Keyword::Optics);
    dict.insert("aggregation", Keyword::Aggregation);
    dict.insert("adjustment", Keyword::Adjustment);
    dict.insert("scale", Keyword::Scale);
    dict.insert("alarm", Keyword::Alarm);
    dict.insert("access", Keyword::Access);
    dict.insert("alarm_major", Keyword::AlarmMajor);
    dict.insert("alarm_minor", Keyword::AlarmMinor);
    dict.insert("alarm_minor_soak", Keyword::AlarmMinorSoak);
    dict.insert("type", Keyword::SensorType);
    dict.insert("linear_four_curves", Keyword::FourCurves);
    dict.insert("incrementpid", Keyword::IncrementPid);
    dict.insert("pid", Keyword::Pid);
    dict.insert("disable", Keyword::Disable);
    dict.insert("normal_up_table", Keyword::NormalUpTable);
    dict.insert("normal_down_table", Keyword::NormalDownTable);
    dict.insert("onefail_up_table", Keyword::FailUpTable);
    dict.insert("onefail_down_table", Keyword::FailDownTable);
    dict.insert("setpoint", Keyword::SetPoint);
    dict.insert("positive_hysteresis", Keyword::PosHysteresis);
    dict.insert("negative_hysteresis", Keyword::NegHysteresis);
    dict.insert("kp", Keyword::Kp);
    dict.insert("ki", Keyword::Ki);
    dict.insert("kd", Keyword::Kd);
    dict.insert("range_check", Keyword::RangeCheck);
    dict.insert("range_low", Keyword::RangeLow);
    dict.insert("range_high", Keyword::RangeHigh);
    dict.insert("tolerance", Keyword::Tolerance);
    dict.insert("invalid_range_action", Keyword::InvalidRangeAction);
    dict.insert("shutdown", Keyword::ActionShutdown);
    dict.insert("no_action", Keyword::ActionNone);
    for table in OpticTableType::ALL {
        dict.insert(table.keyword(), Keyword::OpticTable(table));
    }
    dict
}

fn convert_keyword(keyword: &str) -> Keyword {
    KEYWORDS.get(keyword).copied().unwrap_or(Keyword::Invalid)
}

// ============================================================================
// Config types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BspType {
    #[default]
    Generic,
    Darwin,
    Lassen,
    Minipack3,
    Mokujin,
}

impl BspType {
    pub fn keyword(&self) -> &'static str {
        match self {
            BspType::Generic => "generic",
            BspType::Darwin => "darwin",
            BspType::Lassen => "lassen",
            BspType::Minipack3 => "minipack3",
            BspType::Mokujin => "mokujin",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AccessType {
    Sysfs,
    Thrift,
    Util,
    Rest,
    #[default]
    Invalid,
}

impl AccessType {
    pub fn keyword(&self) -> &'static str {
        match self {
            AccessType::Sysfs => "sysfs",
            AccessType::Thrift => "thrift",
            AccessType::Util => "util",
            AccessType::Rest => "REST",
            AccessType::Invalid => "invalid",
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Where and how a value is read or written
#[derive(Clone, Debug, PartialEq, Default)]
pub struct AccessMethod {
    pub access_type: AccessType,
    pub path: String,
}

impl AccessMethod {
    pub fn new(access_type: AccessType, path: impl Into<String>) -> Self {
        Self {
            access_type,
            path: path.into(),
        }
    }

    pub fn sysfs(path: impl Into<String>) -> Self {
        Self::new(AccessType::Sysfs, path)
    }

    pub fn is_configured(&self) -> bool {
        self.access_type != AccessType::Invalid && !self.path.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ZoneType {
    #[default]
    Max,
    Min,
    Avg,
}

impl ZoneType {
    pub fn keyword(&self) -> &'static str {
        match self {
            ZoneType::Max => "max",
            ZoneType::Min => "min",
            ZoneType::Avg => "avg",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Zone {
    pub name: String,
    pub zone_type: ZoneType,
    /// Sensor or optic names feeding this zone
    pub sensor_names: Vec<String>,
    pub fan_names: Vec<String>,
    /// Maximum PWM percent change per control cycle; 0 disables slewing
    pub slope: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FanConfig {
    pub name: String,
    pub pwm: AccessMethod,
    pub rpm: AccessMethod,
    pub led: AccessMethod,
    pub presence: AccessMethod,
    pub pwm_min: i32,
    pub pwm_max: i32,
    pub fan_present_val: u32,
    pub fan_missing_val: u32,
    pub fan_fail_led_val: u32,
    pub fan_good_led_val: u32,
}

impl FanConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pwm: AccessMethod::default(),
            rpm: AccessMethod::default(),
            led: AccessMethod::default(),
            presence: AccessMethod::default(),
            pwm_min: defaults::FAN_PWM_MIN,
            pwm_max: defaults::FAN_PWM_MAX,
            fan_present_val: defaults::FAN_PRESENT_VAL,
            fan_missing_val: defaults::FAN_MISSING_VAL,
            fan_fail_led_val: defaults::FAN_FAIL_LED_VAL,
            fan_good_led_val: defaults::FAN_GOOD_LED_VAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CalculationType {
    #[default]
    FourLinearTable,
    IncrementPid,
    Pid,
    Disable,
}

impl CalculationType {
    pub fn keyword(&self) -> &'static str {
        match self {
            CalculationType::FourLinearTable => "linear_four_curves",
            CalculationType::IncrementPid => "incrementpid",
            CalculationType::Pid => "pid",
            CalculationType::Disable => "disable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct FourCurves {
    pub normal_up: Table,
    pub normal_down: Table,
    pub fail_up: Table,
    pub fail_down: Table,
}

/// Gains and set point shared by the PID flavours
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PidSetting {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub set_point: f32,
    pub pos_hysteresis: f32,
    pub neg_hysteresis: f32,
}

impl PidSetting {
    pub fn min_val(&self) -> f32 {
        self.set_point - self.neg_hysteresis
    }

    pub fn max_val(&self) -> f32 {
        self.set_point + self.pos_hysteresis
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Alarm {
    pub high_major: f32,
    pub high_minor: f32,
    pub minor_soak_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RangeCheckAction {
    Shutdown,
    #[default]
    NoAction,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct RangeCheck {
    pub range_low: f32,
    pub range_high: f32,
    /// Consecutive out-of-range cycles before the action fires
    pub tolerance: u32,
    pub action: RangeCheckAction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SensorConfig {
    pub name: String,
    pub access: AccessMethod,
    pub scale: f32,
    pub offset_table: Table,
    pub alarm: Option<Alarm>,
    pub range_check: Option<RangeCheck>,
    pub calculation_type: CalculationType,
    pub four_curves: FourCurves,
    pub pid: PidSetting,
}

impl SensorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access: AccessMethod::default(),
            scale: defaults::SENSOR_SCALE,
            offset_table: Table::new(),
            alarm: None,
            range_check: None,
            calculation_type: CalculationType::default(),
            four_curves: FourCurves::default(),
            pid: PidSetting::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OpticAggregation {
    #[default]
    Max,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct OpticConfig {
    pub name: String,
    pub access: AccessMethod,
    pub aggregation: OpticAggregation,
    /// Temperature to PWM table per transceiver class
    pub tables: Vec<(OpticTableType, Table)>,
}

impl OpticConfig {
    pub fn table(&self, table_type: OpticTableType) -> Option<&Table> {
        self.tables
            .iter()
            .find(|(t, _)| *t == table_type)
            .map(|(_, table)| table)
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Watchdog {
    pub access: AccessMethod,
    pub value: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceConfig {
    pub bsp_type: BspType,
    pub pwm_boost_value: f32,
    pub pwm_transition_value: f32,
    /// 0 disables the trigger
    pub pwm_boost_on_dead_fan: u32,
    /// 0 disables the trigger
    pub pwm_boost_on_dead_sensor: u32,
    /// 0 disables the trigger
    pub pwm_boost_no_qsfp_after_secs: u64,
    pub pwm_upper_threshold: f32,
    pub pwm_lower_threshold: f32,
    pub watchdog: Option<Watchdog>,
    pub shutdown_command: Option<String>,
    pub sensor_fetch_frequency_secs: u64,
    pub control_frequency_secs: u64,
    pub zones: Vec<Zone>,
    pub fans: Vec<FanConfig>,
    pub sensors: Vec<SensorConfig>,
    pub optics: Vec<OpticConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bsp_type: BspType::Generic,
            pwm_boost_value: 0.0,
            pwm_transition_value: 0.0,
            pwm_boost_on_dead_fan: 0,
            pwm_boost_on_dead_sensor: 0,
            pwm_boost_no_qsfp_after_secs: 0,
            pwm_upper_threshold: defaults::PWM_UPPER_THRESHOLD,
            pwm_lower_threshold: defaults::PWM_LOWER_THRESHOLD,
            watchdog: None,
            shutdown_command: None,
            sensor_fetch_frequency_secs: defaults::SENSOR_FETCH_FREQUENCY_SECS,
            control_frequency_secs: defaults::CONTROL_FREQUENCY_SECS,
            zones: Vec::new(),
            fans: Vec::new(),
            sensors: Vec::new(),
            optics: Vec::new(),
        }
    }
}

// ============================================================================
// Typed JSON accessors
// ============================================================================

fn as_object<'a>(value: &'a Value, field: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| FanServiceError::invalid_config(field, "expected an object"))
}

fn as_array<'a>(value: &'a Value, field: &str) -> Result<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| FanServiceError::invalid_config(field, "expected an array"))
}

fn as_str<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| FanServiceError::invalid_config(field, "expected a string"))
}

fn as_f32(value: &Value, field: &str) -> Result<f32> {
    value
        .as_f64()
        .map(|v| v as f32)
        .ok_or_else(|| FanServiceError::invalid_config(field, "expected a number"))
}

fn as_u64(value: &Value, field: &str) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| FanServiceError::invalid_config(field, "expected a non-negative integer"))
}

fn as_u32(value: &Value, field: &str) -> Result<u32> {
    u32::try_from(as_u64(value, field)?)
        .map_err(|_| FanServiceError::invalid_config(field, "value out of range"))
}

fn as_i32(value: &Value, field: &str) -> Result<i32> {
    value
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| FanServiceError::invalid_config(field, "expected an integer"))
}

fn as_string_list(value: &Value, field: &str) -> Result<Vec<String>> {
    as_array(value, field)?
        .iter()
        .map(|item| as_str(item, field).map(str::to_string))
        .collect()
}

fn unrecognized(context: &str, key: &str) -> FanServiceError {
    error!(context, key, "Unrecognizable config keyword");
    FanServiceError::config(format!("Unrecognizable {} keyword {}", context, key))
}

// ============================================================================
// Parsing
// ============================================================================

impl ServiceConfig {
    /// Load and parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| FanServiceError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        info!(path = %path.display(), bytes = contents.len(), "Loading fan service config");
        Self::parse(&contents)
    }

    /// Parse a config document
    pub fn parse(contents: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(contents)?;
        let mut config = ServiceConfig::default();

        for (key, value) in as_object(&root, "root")? {
            match convert_keyword(key) {
                Keyword::Zones => config.zones = parse_zones(value)?,
                Keyword::Fans => config.fans = parse_fans(value)?,
                Keyword::Sensors => config.sensors = parse_sensors(value)?,
                Keyword::Optics => config.optics = parse_optics(value)?,
                Keyword::PwmBoostValue => config.pwm_boost_value = as_f32(value, key)?,
                Keyword::PwmTransitionValue => config.pwm_transition_value = as_f32(value, key)?,
                Keyword::BoostOnDeadFan => config.pwm_boost_on_dead_fan = as_u32(value, key)?,
                Keyword::BoostOnDeadSensor => config.pwm_boost_on_dead_sensor = as_u32(value, key)?,
                Keyword::BoostOnNoQsfpAfter => {
                    config.pwm_boost_no_qsfp_after_secs = as_u64(value, key)?
                }
                Keyword::PwmUpper => config.pwm_upper_threshold = as_f32(value, key)?,
                Keyword::PwmLower => config.pwm_lower_threshold = as_f32(value, key)?,
                Keyword::Watchdog => config.watchdog = Some(parse_watchdog(value)?),
                Keyword::ShutdownCommand => {
                    config.shutdown_command = Some(as_str(value, key)?.to_string())
                }
                Keyword::SensorFetchFrequency => {
                    config.sensor_fetch_frequency_secs = as_u64(value, key)?
                }
                Keyword::ControlFrequency => config.control_frequency_secs = as_u64(value, key)?,
                Keyword::Bsp => config.bsp_type = parse_bsp_type(as_str(value, key)?)?,
                _ => return Err(unrecognized("fan_service config", key)),
            }
        }

        config.validate()?;
        debug!(
            zones = config.zones.len(),
            fans = config.fans.len(),
            sensors = config.sensors.len(),
            optics = config.optics.len(),
            bsp = config.bsp_type.keyword(),
            "Parsed fan service config"
        );
        Ok(config)
    }

    /// Cross-reference and range checks that individual keys cannot express
    pub fn validate(&self) -> Result<()> {
        if self.pwm_lower_threshold > self.pwm_upper_threshold {
            return Err(FanServiceError::invalid_config(
                "pwm_percent_lower_limit",
                "must not exceed pwm_percent_upper_limit",
            ));
        }
        for fan in &self.fans {
            if fan.pwm_min > fan.pwm_max {
                return Err(FanServiceError::invalid_config(
                    format!("fans.{}.pwm_min", fan.name),
                    "must not exceed pwm_max",
                ));
            }
        }
        for zone in &self.zones {
            if zone.slope < 0.0 {
                return Err(FanServiceError::invalid_config(
                    format!("zones.{}.slope", zone.name),
                    "must not be negative",
                ));
            }
            for sensor_name in &zone.sensor_names {
                if self.sensor(sensor_name).is_none() && self.optic(sensor_name).is_none() {
                    return Err(FanServiceError::invalid_config(
                        format!("zones.{}.sensors", zone.name),
                        format!("{} is neither a configured sensor nor an optic", sensor_name),
                    ));
                }
            }
            for fan_name in &zone.fan_names {
                if self.fan(fan_name).is_none() {
                    return Err(FanServiceError::invalid_config(
                        format!("zones.{}.fans", zone.name),
                        format!("{} is not a configured fan", fan_name),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn sensor(&self, name: &str) -> Option<&SensorConfig> {
        self.sensors.iter().find(|s| s.name == name)
    }

    pub fn fan(&self, name: &str) -> Option<&FanConfig> {
        self.fans.iter().find(|f| f.name == name)
    }

    pub fn optic(&self, name: &str) -> Option<&OpticConfig> {
        self.optics.iter().find(|o| o.name == name)
    }

    pub fn is_sensor_present_in_config(&self, name: &str) -> bool {
        self.sensor(name).is_some()
    }
}

fn parse_bsp_type(value: &str) -> Result<BspType> {
    match convert_keyword(value) {
        Keyword::BspGeneric => Ok(BspType::Generic),
        Keyword::BspDarwin => Ok(BspType::Darwin),
        Keyword::BspLassen => Ok(BspType::Lassen),
        Keyword::BspMinipack3 => Ok(BspType::Minipack3),
        Keyword::BspMokujin => Ok(BspType::Mokujin),
        _ => Err(unrecognized("BSP type", value)),
    }
}

fn parse_access_method(value: &Value) -> Result<AccessMethod> {
    let mut access = AccessMethod::default();
    for (key, item) in as_object(value, "access")? {
        match convert_keyword(key) {
            Keyword::Source => {
                let source = as_str(item, key)?;
                access.access_type = match convert_keyword(source) {
                    Keyword::SourceSysfs => AccessType::Sysfs,
                    Keyword::SourceThrift => AccessType::Thrift,
                    Keyword::SourceUtil => AccessType::Util,
                    Keyword::SourceRest => AccessType::Rest,
                    _ => return Err(unrecognized("access source", source)),
                };
            }
            Keyword::Path => access.path = as_str(item, key)?.to_string(),
            _ => return Err(unrecognized("access method", key)),
        }
    }
    Ok(access)
}

/// An array of two-element arrays, kept in document order
fn parse_table(value: &Value, field: &str) -> Result<Table> {
    as_array(value, field)?
        .iter()
        .map(|pair| {
            let pair = as_array(pair, field)?;
            if pair.len() != 2 {
                return Err(FanServiceError::invalid_config(
                    field,
                    "table entries must be [breakpoint, value] pairs",
                ));
            }
            Ok((as_f32(&pair[0], field)?, as_f32(&pair[1], field)?))
        })
        .collect()
}

fn parse_alarm(value: &Value) -> Result<Alarm> {
    let mut alarm = Alarm::default();
    for (key, item) in as_object(value, "alarm")? {
        match convert_keyword(key) {
            Keyword::AlarmMajor => alarm.high_major = as_f32(item, key)?,
            Keyword::AlarmMinor => alarm.high_minor = as_f32(item, key)?,
            Keyword::AlarmMinorSoak => alarm.minor_soak_secs = as_u64(item, key)?,
            _ => return Err(unrecognized("alarm", key)),
        }
    }
    Ok(alarm)
}

fn parse_range_check(value: &Value) -> Result<RangeCheck> {
    let mut range = RangeCheck::default();
    let mut low_set = false;
    let mut high_set = false;
    for (key, item) in as_object(value, "range_check")? {
        match convert_keyword(key) {
            Keyword::RangeLow => {
                range.range_low = as_f32(item, key)?;
                low_set = true;
            }
            Keyword::RangeHigh => {
                range.range_high = as_f32(item, key)?;
                high_set = true;
            }
            Keyword::Tolerance => range.tolerance = as_u32(item, key)?,
            Keyword::InvalidRangeAction => {
                let action = as_str(item, key)?;
                range.action = match convert_keyword(action) {
                    Keyword::ActionShutdown => RangeCheckAction::Shutdown,
                    Keyword::ActionNone => RangeCheckAction::NoAction,
                    _ => return Err(unrecognized("invalid range action", action)),
                };
            }
            _ => return Err(unrecognized("range check", key)),
        }
    }
    if !(low_set && high_set) {
        return Err(FanServiceError::invalid_config(
            "range_check",
            "both range_low and range_high are required",
        ));
    }
    Ok(range)
}

fn parse_watchdog(value: &Value) -> Result<Watchdog> {
    let mut watchdog = Watchdog::default();
    for (key, item) in as_object(value, "watchdog")? {
        match convert_keyword(key) {
            Keyword::Access => watchdog.access = parse_access_method(item)?,
            Keyword::WatchdogValue => watchdog.value = as_i32(item, key)?,
            _ => return Err(unrecognized("watchdog", key)),
        }
    }
    Ok(watchdog)
}

fn parse_zones(value: &Value) -> Result<Vec<Zone>> {
    let mut zones = Vec::new();
    for (zone_name, attribs) in as_object(value, "zones")? {
        let mut zone = Zone {
            name: zone_name.clone(),
            ..Zone::default()
        };
        for (key, item) in as_object(attribs, zone_name)? {
            match convert_keyword(key) {
                Keyword::ZoneType => {
                    let zone_type = as_str(item, key)?;
                    zone.zone_type = match convert_keyword(zone_type) {
                        Keyword::ZoneTypeMax => ZoneType::Max,
                        Keyword::ZoneTypeMin => ZoneType::Min,
                        Keyword::ZoneTypeAvg => ZoneType::Avg,
                        _ => return Err(unrecognized("zone type", zone_type)),
                    };
                }
                Keyword::Slope => zone.slope = as_f32(item, key)?,
                Keyword::Sensors => zone.sensor_names = as_string_list(item, key)?,
                Keyword::Fans => zone.fan_names = as_string_list(item, key)?,
                _ => return Err(unrecognized("zone", key)),
            }
        }
        zones.push(zone);
    }
    Ok(zones)
}

fn parse_fans(value: &Value) -> Result<Vec<FanConfig>> {
    let mut fans = Vec::new();
    for (fan_name, attribs) in as_object(value, "fans")? {
        let mut fan = FanConfig::new(fan_name.clone());
        for (key, item) in as_object(attribs, fan_name)? {
            match convert_keyword(key) {
                Keyword::FanPwm => fan.pwm = parse_access_method(item)?,
                Keyword::FanRpm => fan.rpm = parse_access_method(item)?,
                Keyword::FanLed => fan.led = parse_access_method(item)?,
                Keyword::FanPresence => fan.presence = parse_access_method(item)?,
                Keyword::FanPwmMin => fan.pwm_min = as_i32(item, key)?,
                Keyword::FanPwmMax => fan.pwm_max = as_i32(item, key)?,
                Keyword::FanPresentVal => fan.fan_present_val = as_u32(item, key)?,
                Keyword::FanMissingVal => fan.fan_missing_val = as_u32(item, key)?,
                Keyword::FanFailLedVal => fan.fan_fail_led_val = as_u32(item, key)?,
                Keyword::FanGoodLedVal => fan.fan_good_led_val = as_u32(item, key)?,
                _ => return Err(unrecognized("fan", key)),
            }
        }
        fans.push(fan);
    }
    Ok(fans)
}

fn parse_sensors(value: &Value) -> Result<Vec<SensorConfig>> {
    let mut sensors = Vec::new();
    for (sensor_name, attribs) in as_object(value, "sensors")? {
        let mut sensor = SensorConfig::new(sensor_name.clone());
        for (key, item) in as_object(attribs, sensor_name)? {
            match convert_keyword(key) {
                Keyword::Access => sensor.access = parse_access_method(item)?,
                Keyword::Scale => {
                    sensor.scale = as_f32(item, key)?;
                    if sensor.scale == 0.0 {
                        return Err(FanServiceError::invalid_config(
                            format!("sensors.{}.scale", sensor_name),
                            "scale must be non-zero",
                        ));
                    }
                }
                Keyword::Adjustment => sensor.offset_table = parse_table(item, key)?,
                Keyword::SensorType => {
                    let calc = as_str(item, key)?;
                    sensor.calculation_type = match convert_keyword(calc) {
                        Keyword::FourCurves => CalculationType::FourLinearTable,
                        Keyword::IncrementPid => CalculationType::IncrementPid,
                        Keyword::Pid => CalculationType::Pid,
                        Keyword::Disable => CalculationType::Disable,
                        _ => return Err(unrecognized("sensor PWM calculation type", calc)),
                    };
                }
                Keyword::NormalUpTable => sensor.four_curves.normal_up = parse_table(item, key)?,
                Keyword::NormalDownTable => sensor.four_curves.normal_down = parse_table(item, key)?,
                Keyword::FailUpTable => sensor.four_curves.fail_up = parse_table(item, key)?,
                Keyword::FailDownTable => sensor.four_curves.fail_down = parse_table(item, key)?,
                Keyword::SetPoint => sensor.pid.set_point = as_f32(item, key)?,
                Keyword::PosHysteresis => sensor.pid.pos_hysteresis = as_f32(item, key)?,
                Keyword::NegHysteresis => sensor.pid.neg_hysteresis = as_f32(item, key)?,
                Keyword::Kp => sensor.pid.kp = as_f32(item, key)?,
                Keyword::Ki => sensor.pid.ki = as_f32(item, key)?,
                Keyword::Kd => sensor.pid.kd = as_f32(item, key)?,
                Keyword::Alarm => sensor.alarm = Some(parse_alarm(item)?),
                Keyword::RangeCheck => sensor.range_check = Some(parse_range_check(item)?),
                _ => return Err(unrecognized("sensor", key)),
            }
        }
        sensors.push(sensor);
    }
    Ok(sensors)
}

fn parse_optics(value: &Value) -> Result<Vec<OpticConfig>> {
    let mut optics = Vec::new();
    for (optic_name, attribs) in as_object(value, "optics")? {
        let mut optic = OpticConfig {
            name: optic_name.clone(),
            ..OpticConfig::default()
        };
        for (key, item) in as_object(attribs, optic_name)? {
            match convert_keyword(key) {
                Keyword::Access => optic.access = parse_access_method(item)?,
                Keyword::Aggregation => {
                    let aggregation = as_str(item, key)?;
                    optic.aggregation = match convert_keyword(aggregation) {
                        Keyword::ZoneTypeMax => OpticAggregation::Max,
                        _ => return Err(unrecognized("optic aggregation", aggregation)),
                    };
                }
                Keyword::OpticTable(table_type) => {
                    optic.tables.push((table_type, parse_table(item, key)?));
                }
                _ => return Err(unrecognized("optic", key)),
            }
        }
        optics.push(optic);
    }
    Ok(optics)
}

// ============================================================================
// Serialization
// ============================================================================

fn access_to_json(access: &AccessMethod) -> Value {
    json!({ "source": access.access_type.keyword(), "path": access.path })
}

/// Unset access methods are left out so the output parses again
fn insert_access(map: &mut Map<String, Value>, key: &str, access: &AccessMethod) {
    if access.access_type != AccessType::Invalid {
        map.insert(key.into(), access_to_json(access));
    }
}

fn table_to_json(table: &Table) -> Value {
    Value::Array(table.iter().map(|(k, v)| json!([k, v])).collect())
}

impl ServiceConfig {
    /// Serialize back into the document format accepted by [`ServiceConfig::parse`]
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        root.insert("bsp".into(), json!(self.bsp_type.keyword()));
        root.insert("pwm_boost_value".into(), json!(self.pwm_boost_value));
        root.insert("pwm_transition_value".into(), json!(self.pwm_transition_value));
        root.insert("boost_on_dead_fan".into(), json!(self.pwm_boost_on_dead_fan));
        root.insert("boost_on_dead_sensor".into(), json!(self.pwm_boost_on_dead_sensor));
        root.insert("boost_on_no_qsfp_after".into(), json!(self.pwm_boost_no_qsfp_after_secs));
        root.insert("pwm_percent_upper_limit".into(), json!(self.pwm_upper_threshold));
        root.insert("pwm_percent_lower_limit".into(), json!(self.pwm_lower_threshold));
        root.insert("sensor_fetch_frequency".into(), json!(self.sensor_fetch_frequency_secs));
        root.insert("control_frequency".into(), json!(self.control_frequency_secs));
        if let Some(watchdog) = &self.watchdog {
            let mut w = Map::new();
            insert_access(&mut w, "access", &watchdog.access);
            w.insert("value".into(), json!(watchdog.value));
            root.insert("watchdog".into(), Value::Object(w));
        }
        if let Some(cmd) = &self.shutdown_command {
            root.insert("shutdown_command".into(), json!(cmd));
        }

        let mut zones = Map::new();
        for zone in &self.zones {
            zones.insert(
                zone.name.clone(),
                json!({
                    "zone_type": zone.zone_type.keyword(),
                    "slope": zone.slope,
                    "sensors": zone.sensor_names,
                    "fans": zone.fan_names,
                }),
            );
        }
        root.insert("zones".into(), Value::Object(zones));

        let mut fans = Map::new();
        for fan in &self.fans {
            let mut f = Map::new();
            insert_access(&mut f, "pwm", &fan.pwm);
            insert_access(&mut f, "rpm", &fan.rpm);
            insert_access(&mut f, "led", &fan.led);
            insert_access(&mut f, "presence", &fan.presence);
            f.insert("pwm_min".into(), json!(fan.pwm_min));
            f.insert("pwm_max".into(), json!(fan.pwm_max));
            f.insert("fan_present_val".into(), json!(fan.fan_present_val));
            f.insert("fan_missing_val".into(), json!(fan.fan_missing_val));
            f.insert("fan_fail_led_val".into(), json!(fan.fan_fail_led_val));
            f.insert("fan_good_led_val".into(), json!(fan.fan_good_led_val));
            fans.insert(fan.name.clone(), Value::Object(f));
        }
        root.insert("fans".into(), Value::Object(fans));

        let mut sensors = Map::new();
        for sensor in &self.sensors {
            let mut s = Map::new();
            insert_access(&mut s, "access", &sensor.access);
            s.insert("scale".into(), json!(sensor.scale));
            s.insert("adjustment".into(), table_to_json(&sensor.offset_table));
            s.insert("type".into(), json!(sensor.calculation_type.keyword()));
            s.insert("normal_up_table".into(), table_to_json(&sensor.four_curves.normal_up));
            s.insert("normal_down_table".into(), table_to_json(&sensor.four_curves.normal_down));
            s.insert("onefail_up_table".into(), table_to_json(&sensor.four_curves.fail_up));
            s.insert("onefail_down_table".into(), table_to_json(&sensor.four_curves.fail_down));
            s.insert("setpoint".into(), json!(sensor.pid.set_point));
            s.insert("positive_hysteresis".into(), json!(sensor.pid.pos_hysteresis));
            s.insert("negative_hysteresis".into(), json!(sensor.pid.neg_hysteresis));
            s.insert("kp".into(), json!(sensor.pid.kp));
            s.insert("ki".into(), json!(sensor.pid.ki));
            s.insert("kd".into(), json!(sensor.pid.kd));
            if let Some(alarm) = &sensor.alarm {
                s.insert(
                    "alarm".into(),
                    json!({
                        "alarm_major": alarm.high_major,
                        "alarm_minor": alarm.high_minor,
                        "alarm_minor_soak": alarm.minor_soak_secs,
                    }),
                );
            }
            if let Some(range) = &sensor.range_check {
                let action = match range.action {
                    RangeCheckAction::Shutdown => "shutdown",
                    RangeCheckAction::NoAction => "no_action",
                };
                s.insert(
                    "range_check".into(),
                    json!({
                        "range_low": range.range_low,
                        "range_high": range.range_high,
                        "tolerance": range.tolerance,
                        "invalid_range_action": action,
                    }),
                );
            }
            sensors.insert(sensor.name.clone(), Value::Object(s));
        }
        root.insert("sensors".into(), Value::Object(sensors));

        let mut optics = Map::new();
        for optic in &self.optics {
            let mut o = Map::new();
            insert_access(&mut o, "access", &optic.access);
            o.insert("aggregation".into(), json!("max"));
            for (table_type, table) in &optic.tables {
                o.insert(table_type.keyword().into(), table_to_json(table));
            }
            optics.insert(optic.name.clone(), Value::Object(o));
        }
        root.insert("optics".into(), Value::Object(optics));

        Value::Object(root)
    }
}

/// Resolve the config file: explicit override, then environment, then default
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(defaults::CONFIG_PATH_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(defaults::CONFIG_PATH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_config_json;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_sample_config() {
        let config = ServiceConfig::parse(&sample_config_json()).unwrap();
        assert_eq!(config.bsp_type, BspType::Generic);
        assert_eq!(config.pwm_boost_value, 60.0);
        assert_eq!(config.pwm_transition_value, 50.0);
        assert_eq!(config.pwm_boost_on_dead_fan, 1);
        assert_eq!(config.shutdown_command.as_deref(), Some("echo shutdown"));
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.fans.len(), 2);

        let sensor = config.sensor("CPU_TEMP").unwrap();
        assert_eq!(sensor.calculation_type, CalculationType::FourLinearTable);
        assert_eq!(sensor.access, AccessMethod::sysfs("/run/devmap/sensors/CPU_TEMP"));
        assert_eq!(sensor.scale, 1000.0);
        assert_eq!(sensor.four_curves.normal_up, vec![(0.0, 10.0), (50.0, 40.0), (80.0, 70.0)]);
        let range = sensor.range_check.as_ref().unwrap();
        assert_eq!(range.action, RangeCheckAction::Shutdown);
        assert_eq!(range.tolerance, 3);

        let optic = config.optic("qsfp_group_1").unwrap();
        assert_eq!(optic.access.access_type, AccessType::Thrift);
        assert!(optic.table(OpticTableType::Speed100).is_some());
        assert!(optic.table(OpticTableType::Speed800).is_none());
    }

    #[test]
    fn test_document_order_is_kept() {
        let config = ServiceConfig::parse(&sample_config_json()).unwrap();
        let names: Vec<_> = config.fans.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["fan_1", "fan_2"]);
    }

    #[test]
    fn test_unknown_top_level_keyword() {
        let err = ServiceConfig::parse(r#"{ "bogus_key": 1 }"#).unwrap_err();
        assert!(matches!(err, FanServiceError::Config(_)));
        assert!(err.to_string().contains("Unrecognizable"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_bsp_type() {
        let err = ServiceConfig::parse(r#"{ "bsp": "wedge" }"#).unwrap_err();
        assert!(err.to_string().contains("Unrecognizable BSP type"));
    }

    #[test]
    fn test_known_keyword_in_wrong_place() {
        // "slope" is a valid keyword, but not at the top level
        let err = ServiceConfig::parse(r#"{ "slope": 3 }"#).unwrap_err();
        assert!(matches!(err, FanServiceError::Config(_)));
    }

    #[test]
    fn test_range_check_requires_bounds() {
        let doc = r#"{ "sensors": { "S": { "range_check": { "range_low": 1, "tolerance": 2 } } } }"#;
        let err = ServiceConfig::parse(doc).unwrap_err();
        assert!(matches!(err, FanServiceError::InvalidConfig { .. }));
    }

    #[test]
    fn test_zone_membership_validated() {
        let doc = r#"{
            "zones": { "z": { "zone_type": "max", "sensors": ["GHOST"], "fans": [] } }
        }"#;
        let err = ServiceConfig::parse(doc).unwrap_err();
        assert!(err.to_string().contains("GHOST"));

        let doc = r#"{
            "sensors": { "S": { "type": "disable" } },
            "zones": { "z": { "zone_type": "max", "sensors": ["S"], "fans": ["fan_9"] } }
        }"#;
        let err = ServiceConfig::parse(doc).unwrap_err();
        assert!(err.to_string().contains("fan_9"));
    }

    #[test]
    fn test_zone_may_reference_optic() {
        let doc = r#"{
            "optics": { "qsfp": { "access": { "source": "thrift", "path": "" }, "speed_100": [[0, 30]] } },
            "zones": { "z": { "zone_type": "avg", "sensors": ["qsfp"], "fans": [] } }
        }"#;
        let config = ServiceConfig::parse(doc).unwrap();
        assert_eq!(config.zones[0].zone_type, ZoneType::Avg);
    }

    #[test]
    fn test_threshold_order_validated() {
        let doc = r#"{ "pwm_percent_upper_limit": 20, "pwm_percent_lower_limit": 30 }"#;
        assert!(ServiceConfig::parse(doc).is_err());
    }

    #[test]
    fn test_negative_slope_rejected() {
        let doc = r#"{ "zones": { "zone1": { "zone_type": "max", "slope": -5 } } }"#;
        match ServiceConfig::parse(doc) {
            Err(FanServiceError::InvalidConfig { field, .. }) => assert_eq!(field, "zones.zone1.slope"),
            other => panic!("unexpected result {:?}", other),
        }

        let doc = r#"{ "zones": { "zone1": { "zone_type": "max", "slope": 0 } } }"#;
        assert!(ServiceConfig::parse(doc).is_ok());
    }

    #[test]
    fn test_malformed_table() {
        let doc = r#"{ "sensors": { "S": { "adjustment": [[1, 2, 3]] } } }"#;
        assert!(ServiceConfig::parse(doc).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let config = ServiceConfig::parse(&sample_config_json()).unwrap();
        let text = serde_json::to_string_pretty(&config.to_json()).unwrap();
        let reparsed = ServiceConfig::parse(&text).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", sample_config_json()).unwrap();
        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.sensors.len(), 2);

        let err = ServiceConfig::from_file(Path::new("/nonexistent/fan_service.json")).unwrap_err();
        assert!(matches!(err, FanServiceError::FileRead { .. }));
    }

    #[test]
    fn test_pid_bounds() {
        let pid = PidSetting {
            set_point: 70.0,
            pos_hysteresis: 2.0,
            neg_hysteresis: 3.0,
            ..PidSetting::default()
        };
        assert_eq!(pid.min_val(), 67.0);
        assert_eq!(pid.max_val(), 72.0);
    }

    #[test]
    #[serial]
    fn test_resolve_config_path() {
        std::env::remove_var(defaults::CONFIG_PATH_ENV);
        assert_eq!(resolve_config_path(None), PathBuf::from(defaults::CONFIG_PATH));

        std::env::set_var(defaults::CONFIG_PATH_ENV, "/tmp/fan.json");
        assert_eq!(resolve_config_path(None), PathBuf::from("/tmp/fan.json"));

        let explicit = PathBuf::from("/opt/explicit.json");
        assert_eq!(resolve_config_path(Some(&explicit)), explicit);
        std::env::remove_var(defaults::CONFIG_PATH_ENV);
    }
}
