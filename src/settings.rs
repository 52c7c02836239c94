// ルートB接続設定
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::skstack::authn::{CredentialError, Credentials};
use nom::Parser;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{digit1, space0};
use nom::combinator::{all_consuming, map_res, opt, value};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid credentials: {0}")]
    Credential(#[from] CredentialError),
    #[error("rejoin_count must be 0..=127 (got {0})")]
    RejoinCountOutOfRange(u32),
    #[error("{0} must be a positive period")]
    NonPositivePeriod(&'static str),
    #[error("settings file syntax error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("settings file read error: {0}")]
    Io(#[from] std::io::Error),
}

/// 期間("30s", "2min", "1h", 整数なら秒)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period(pub Duration);

impl std::str::FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match all_consuming(period).parse(s.trim()) {
            Ok((_, duration)) => Ok(Self(duration)),
            Err(_) => Err(format!("bad period \"{}\"", s)),
        }
    }
}

// 数値 + 単位
fn period(input: &str) -> nom::IResult<&str, Duration> {
    let number = map_res(digit1, str::parse::<u64>);
    let unit = alt((
        value(1u64, tag("ms")),
        value(60_000, tag("min")),
        value(3_600_000, tag("h")),
        value(1_000, tag("s")),
    ));
    let (s, (n, _, unit)) = (number, space0, opt(unit)).parse(input)?;
    let millis = n.saturating_mul(unit.unwrap_or(1_000));
    Ok((s, Duration::from_millis(millis)))
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PeriodVisitor;

        impl Visitor<'_> for PeriodVisitor {
            type Value = Period;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "seconds as integer or a string such as \"30s\"")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Period, E> {
                u64::try_from(v)
                    .map(|secs| Period(Duration::from_secs(secs)))
                    .map_err(|_| E::custom(format!("negative period {}", v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Period, E> {
                Ok(Period(Duration::from_secs(v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Period, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(PeriodVisitor)
    }
}

/// センサーの設定
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorSection {
    pub update_interval: Option<Period>,
}

/// 設定ファイル
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    pub rbid: String,
    pub password: String,
    pub power: Option<SensorSection>,
    pub energy: Option<SensorSection>,
    #[serde(default = "default_rejoin_count")]
    pub rejoin_count: u32,
    pub rejoin_timeout: Option<Period>,
    pub rescan_timeout: Option<Period>,
    pub restart_timeout: Option<Period>,
}

fn default_rejoin_count() -> u32 {
    BRouteSettings::DEFAULT_REJOIN_COUNT as u32
}

/// 検証済みの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BRouteSettings {
    pub credentials: Credentials,
    pub power_interval: Option<Duration>,
    pub energy_interval: Option<Duration>,
    pub rejoin_count: u8,
    pub rejoin_timeout: Duration,
    pub rescan_timeout: Duration,
    pub restart_timeout: Duration,
}

impl BRouteSettings {
    pub const DEFAULT_POWER_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_ENERGY_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_REJOIN_COUNT: u8 = 10;
    pub const MAX_REJOIN_COUNT: u32 = 127;
    pub const DEFAULT_REJOIN_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_RESCAN_TIMEOUT: Duration = Duration::from_secs(240);
    pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(360);

    /// センサー無し、既定のしきい値
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            power_interval: None,
            energy_interval: None,
            rejoin_count: Self::DEFAULT_REJOIN_COUNT,
            rejoin_timeout: Self::DEFAULT_REJOIN_TIMEOUT,
            rescan_timeout: Self::DEFAULT_RESCAN_TIMEOUT,
            restart_timeout: Self::DEFAULT_RESTART_TIMEOUT,
        }
    }

    pub fn with_power(mut self, interval: Duration) -> Self {
        self.power_interval = Some(interval);
        self
    }

    pub fn with_energy(mut self, interval: Duration) -> Self {
        self.energy_interval = Some(interval);
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: SettingsFile = toml::from_str(s)?;
        Self::try_from(file)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }
}

// 0秒は受け付けない
fn positive(
    name: &'static str,
    period: Option<Period>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match period {
        Some(Period(d)) if d.is_zero() => Err(ConfigError::NonPositivePeriod(name)),
        Some(Period(d)) => Ok(d),
        None => Ok(default),
    }
}

impl TryFrom<SettingsFile> for BRouteSettings {
    type Error = ConfigError;

    fn try_from(file: SettingsFile) -> Result<Self, Self::Error> {
        let credentials = Credentials::new(&file.rbid, &file.password)?;
        let rejoin_count = match file.rejoin_count {
            n if n <= Self::MAX_REJOIN_COUNT => n as u8,
            n => return Err(ConfigError::RejoinCountOutOfRange(n)),
        };
        let power_interval = file
            .power
            .map(|s| positive("power.update_interval", s.update_interval, Self::DEFAULT_POWER_INTERVAL))
            .transpose()?;
        let energy_interval = file
            .energy
            .map(|s| {
                positive("energy.update_interval", s.update_interval, Self::DEFAULT_ENERGY_INTERVAL)
            })
            .transpose()?;
        Ok(Self {
            credentials,
            power_interval,
            energy_interval,
            rejoin_count,
            rejoin_timeout: positive(
                "rejoin_timeout",
                file.rejoin_timeout,
                Self::DEFAULT_REJOIN_TIMEOUT,
            )?,
            rescan_timeout: positive(
                "rescan_timeout",
                file.rescan_timeout,
                Self::DEFAULT_RESCAN_TIMEOUT,
            )?,
            restart_timeout: positive(
                "restart_timeout",
                file.restart_timeout,
                Self::DEFAULT_RESTART_TIMEOUT,
            )?,
        })
    }
}

#[test]
fn test_period() {
    assert_eq!("30s".parse(), Ok(Period(Duration::from_secs(30))));
    assert_eq!("2min".parse(), Ok(Period(Duration::from_secs(120))));
    assert_eq!("1h".parse(), Ok(Period(Duration::from_secs(3600))));
    assert_eq!("500ms".parse(), Ok(Period(Duration::from_millis(500))));
    assert_eq!("45".parse(), Ok(Period(Duration::from_secs(45))));
    assert!("30 days".parse::<Period>().is_err());
    assert!("-1s".parse::<Period>().is_err());
}

#[test]
fn test_settings_file() {
    let settings = BRouteSettings::from_toml_str(
        r#"
rbid = "0123456789ABCDEF0123456789ABCDEF"
password = "secret"
rejoin_count = 5
restart_timeout = "10min"

[power]
update_interval = "10s"

[energy]
"#,
    )
    .unwrap();
    assert_eq!(settings.power_interval, Some(Duration::from_secs(10)));
    assert_eq!(settings.energy_interval, Some(Duration::from_secs(60)));
    assert_eq!(settings.rejoin_count, 5);
    assert_eq!(settings.rejoin_timeout, Duration::from_secs(120));
    assert_eq!(settings.rescan_timeout, Duration::from_secs(240));
    assert_eq!(settings.restart_timeout, Duration::from_secs(600));
    // パスワードはログに出ない
    assert!(!format!("{:?}", settings).contains("secret"));
}

#[test]
fn test_settings_defaults() {
    let settings = BRouteSettings::from_toml_str(
        r#"
rbid = "0123456789ABCDEF0123456789ABCDEF"
password = "secret"
"#,
    )
    .unwrap();
    assert_eq!(settings.power_interval, None);
    assert_eq!(settings.energy_interval, None);
    assert_eq!(settings.rejoin_count, 10);
}

#[test]
fn test_settings_errors() {
    let with = |extra: &str| {
        BRouteSettings::from_toml_str(&format!(
            "rbid = \"0123456789ABCDEF0123456789ABCDEF\"\npassword = \"secret\"\n{}",
            extra
        ))
    };
    assert!(matches!(
        with("rejoin_count = 128"),
        Err(ConfigError::RejoinCountOutOfRange(128))
    ));
    assert!(matches!(
        with("[power]\nupdate_interval = 0"),
        Err(ConfigError::NonPositivePeriod("power.update_interval"))
    ));
    assert!(matches!(with("rejoin_timeout = -5"), Err(ConfigError::Toml(_))));
    assert!(matches!(with("unknown = 1"), Err(ConfigError::Toml(_))));
    assert!(matches!(
        BRouteSettings::from_toml_str("rbid = \"short\"\npassword = \"secret\""),
        Err(ConfigError::Credential(CredentialError::IdLength(5)))
    ));
    assert!(matches!(
        BRouteSettings::from_toml_str(
            "rbid = \"0123456789ABCDEF0123456789ABCDEF\"\npassword = \"\""
        ),
        Err(ConfigError::Credential(CredentialError::PasswordLength(0)))
    ));
}
