// スマートメーターの応答から計測値を取り出す
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::echonetlite::{EchonetliteFrame, smart_electric_energy_meter as SM};
pub use crate::echonetlite::smart_electric_energy_meter::EnergyScale;
use rust_decimal::Decimal;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("echonetlite frame decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("not an echonetlite format 1 frame (EHD=0x{0:04X})")]
    NotEchonetlite(u16),
    #[error("not from a low voltage smart meter (SEOJ={0:02X?})")]
    UnexpectedSender([u8; 3]),
    #[error("property 0x{0:02X} is not available (Get_SNA)")]
    NotAvailable(u8),
    #[error("unexpected ESV 0x{0:02X}")]
    UnexpectedEsv(u8),
    #[error("property 0x{0:02X} is missing")]
    PropertyMissing(u8),
    #[error("bad property: {0}")]
    BadProperty(String),
    #[error("energy coefficient and unit are not received yet")]
    EnergyScaleUnknown,
}

/// 計測値の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Power,
    Energy,
}

impl MetricKind {
    /// 要求するプロパティ
    pub fn epc(&self) -> u8 {
        match self {
            Self::Power => SM::InstantiousPower::EPC,
            Self::Energy => SM::CumlativeAmountsPower::EPC,
        }
    }

    pub fn unit(&self) -> Unit {
        match self {
            Self::Power => Unit::Watt,
            Self::Energy => Unit::KiloWattHour,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Power => write!(f, "power"),
            Self::Energy => write!(f, "energy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Watt,
    KiloWattHour,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Watt => write!(f, "W"),
            Self::KiloWattHour => write!(f, "kWh"),
        }
    }
}

/// 計測値
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub kind: MetricKind,
    pub value: Decimal,
    pub unit: Unit,
    pub accuracy_decimals: u32,
    pub timestamp: Instant,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}={} {}",
            self.kind,
            self.value.round_dp(self.accuracy_decimals),
            self.unit
        )
    }
}

/// 応答の解析器
///
/// 積算電力量の係数と単位はスマートメーターから受け取るまで分からない。
#[derive(Debug, Default)]
pub struct ReadingParser {
    coefficient: Option<SM::Coefficient>,
    unit: Option<SM::UnitForCumlativeAmountsPower>,
}

impl ReadingParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn energy_scale(&self) -> Option<EnergyScale> {
        match (&self.unit, &self.coefficient) {
            (Some(unit), Some(coefficient)) => Some(EnergyScale {
                unit: unit.clone(),
                coefficient: *coefficient,
            }),
            _ => None,
        }
    }

    /// 計測値を取り出す
    pub fn parse(
        &self,
        payload: &[u8],
        kind: MetricKind,
        now: Instant,
    ) -> Result<Reading, ParseError> {
        let frame = decode_from_smart_meter(payload)?;
        match frame.esv {
            EchonetliteFrame::ESV_GET_RES | EchonetliteFrame::ESV_INF => {}
            EchonetliteFrame::ESV_GET_SNA => return Err(ParseError::NotAvailable(kind.epc())),
            esv => return Err(ParseError::UnexpectedEsv(esv)),
        }
        let edata = frame
            .find(kind.epc())
            .cloned()
            .ok_or(ParseError::PropertyMissing(kind.epc()))?;
        match kind {
            MetricKind::Power => {
                let power = SM::InstantiousPower::try_from(edata).map_err(ParseError::BadProperty)?;
                Ok(Reading {
                    kind,
                    value: power.0,
                    unit: kind.unit(),
                    accuracy_decimals: 0,
                    timestamp: now,
                })
            }
            MetricKind::Energy => {
                let scale = self.energy_scale().ok_or(ParseError::EnergyScaleUnknown)?;
                let amount =
                    SM::CumlativeAmountsPower::try_from(edata).map_err(ParseError::BadProperty)?;
                // メーターのリセットで値が減ることもあるのでそのまま渡す
                Ok(Reading {
                    kind,
                    value: scale.kwh(amount.0),
                    unit: kind.unit(),
                    accuracy_decimals: scale.accuracy_decimals(),
                    timestamp: now,
                })
            }
        }
    }

    /// 係数と積算電力量単位を受け取る
    pub fn absorb_energy_parameters(&mut self, payload: &[u8]) -> Result<(), ParseError> {
        let frame = decode_from_smart_meter(payload)?;
        let not_available = frame.esv == EchonetliteFrame::ESV_GET_SNA;
        if !not_available && frame.esv != EchonetliteFrame::ESV_GET_RES {
            return Err(ParseError::UnexpectedEsv(frame.esv));
        }
        // 係数が無いメーターは Get_SNA で 0xd3 を空にして、0xe1 は値付きで返してくる
        for edata in frame.edata.iter() {
            match edata.epc {
                SM::Coefficient::EPC => {
                    let coefficient = SM::Coefficient::try_from(edata.clone())
                        .map_err(ParseError::BadProperty)?;
                    tracing::debug!("{}", coefficient);
                    self.coefficient = Some(coefficient);
                }
                SM::UnitForCumlativeAmountsPower::EPC if edata.edt.is_empty() => {
                    tracing::debug!("unit 0x{:02X} is not available", edata.epc);
                }
                SM::UnitForCumlativeAmountsPower::EPC => {
                    let unit = SM::UnitForCumlativeAmountsPower::try_from(edata.clone())
                        .map_err(ParseError::BadProperty)?;
                    tracing::debug!("{}", unit);
                    self.unit = Some(unit);
                }
                epc => tracing::debug!("Drop property response 0x{:02X}", epc),
            }
        }
        if self.energy_scale().is_some() {
            Ok(())
        } else if not_available {
            Err(ParseError::NotAvailable(SM::UnitForCumlativeAmountsPower::EPC))
        } else {
            Err(ParseError::PropertyMissing(SM::UnitForCumlativeAmountsPower::EPC))
        }
    }

    /// 定時積算電力量計測値の通知
    pub fn fixed_time_notification(
        &self,
        payload: &[u8],
    ) -> Result<SM::CumlativeAmountsOfPowerAtFixedTime, ParseError> {
        let frame = decode_from_smart_meter(payload)?;
        if frame.esv != EchonetliteFrame::ESV_INF {
            return Err(ParseError::UnexpectedEsv(frame.esv));
        }
        let epc = SM::CumlativeAmountsOfPowerAtFixedTime::EPC;
        let edata = frame
            .find(epc)
            .cloned()
            .ok_or(ParseError::PropertyMissing(epc))?;
        SM::CumlativeAmountsOfPowerAtFixedTime::try_from(edata).map_err(ParseError::BadProperty)
    }

    /// 要求していない通知(定時積算電力量など)を読める形にする
    pub fn describe(&self, payload: &[u8]) -> Result<String, ParseError> {
        let frame = decode_from_smart_meter(payload)?;
        let scale = self.energy_scale();
        let mut s = vec![frame.show()];
        for edata in frame.edata.iter() {
            s.push(edata.show(scale.as_ref()));
        }
        Ok(s.join(" "))
    }
}

// スマートメーターからのEchonetliteフレーム
fn decode_from_smart_meter(payload: &[u8]) -> Result<EchonetliteFrame<'_>, ParseError> {
    let frame = EchonetliteFrame::decode(payload)?;
    if frame.ehd != EchonetliteFrame::EHD {
        return Err(ParseError::NotEchonetlite(frame.ehd));
    }
    if !frame.is_from_smart_meter() {
        return Err(ParseError::UnexpectedSender(frame.seoj));
    }
    Ok(frame)
}

#[cfg(test)]
fn response(esv: u8, props: &[(u8, &[u8])]) -> Vec<u8> {
    let mut v = vec![0x10, 0x81, 0x00, 0x01, 0x02, 0x88, 0x01, 0x05, 0xff, 0x01, esv];
    v.push(props.len() as u8);
    for (epc, edt) in props {
        v.push(*epc);
        v.push(edt.len() as u8);
        v.extend_from_slice(edt);
    }
    v
}

#[test]
fn test_power() {
    let parser = ReadingParser::new();
    let now = Instant::now();
    let payload = response(0x72, &[(0xe7, &1234i32.to_be_bytes())]);
    let reading = parser.parse(&payload, MetricKind::Power, now).unwrap();
    assert_eq!(reading.value, Decimal::new(1234, 0));
    assert_eq!(reading.unit, Unit::Watt);
    assert_eq!(reading.accuracy_decimals, 0);
    assert_eq!(reading.timestamp, now);
    assert_eq!(reading.to_string(), "power=1234 W");
}

#[test]
fn test_power_wrong_length() {
    let parser = ReadingParser::new();
    let payload = response(0x72, &[(0xe7, &[0x04, 0xd2])]);
    assert!(matches!(
        parser.parse(&payload, MetricKind::Power, Instant::now()),
        Err(ParseError::BadProperty(_))
    ));
    // 途中で切れている
    assert!(matches!(
        parser.parse(&payload[..13], MetricKind::Power, Instant::now()),
        Err(ParseError::Decode(_))
    ));
}

#[test]
fn test_header_checks() {
    let parser = ReadingParser::new();
    let mut payload = response(0x72, &[(0xe7, &[0, 0, 0, 1])]);
    payload[1] = 0x82;
    assert!(matches!(
        parser.parse(&payload, MetricKind::Power, Instant::now()),
        Err(ParseError::NotEchonetlite(0x1082))
    ));

    let mut payload = response(0x72, &[(0xe7, &[0, 0, 0, 1])]);
    payload[5] = 0x87;
    assert!(matches!(
        parser.parse(&payload, MetricKind::Power, Instant::now()),
        Err(ParseError::UnexpectedSender(_))
    ));

    let payload = response(0x52, &[(0xe7, &[])]);
    assert!(matches!(
        parser.parse(&payload, MetricKind::Power, Instant::now()),
        Err(ParseError::NotAvailable(0xe7))
    ));

    let payload = response(0x72, &[(0xe8, &[0, 10, 0x7f, 0xfe])]);
    assert!(matches!(
        parser.parse(&payload, MetricKind::Power, Instant::now()),
        Err(ParseError::PropertyMissing(0xe7))
    ));
}

#[test]
fn test_energy() {
    let mut parser = ReadingParser::new();
    let payload = response(0x72, &[(0xe0, &12345u32.to_be_bytes())]);
    assert!(matches!(
        parser.parse(&payload, MetricKind::Energy, Instant::now()),
        Err(ParseError::EnergyScaleUnknown)
    ));

    let params = response(0x72, &[(0xd3, &[0, 0, 0, 1]), (0xe1, &[0x01])]);
    parser.absorb_energy_parameters(&params).unwrap();
    let reading = parser
        .parse(&payload, MetricKind::Energy, Instant::now())
        .unwrap();
    assert_eq!(reading.value, Decimal::new(12345, 1));
    assert_eq!(reading.unit, Unit::KiloWattHour);
    assert_eq!(reading.accuracy_decimals, 1);

    // 減少してもそのまま
    let smaller = response(0x72, &[(0xe0, &5u32.to_be_bytes())]);
    let reading = parser
        .parse(&smaller, MetricKind::Energy, Instant::now())
        .unwrap();
    assert_eq!(reading.value, Decimal::new(5, 1));
}

#[test]
fn test_energy_parameters_without_coefficient() {
    let mut parser = ReadingParser::new();
    // 係数が無いメーター
    let sna = response(0x52, &[(0xd3, &[]), (0xe1, &[])]);
    assert!(parser.absorb_energy_parameters(&sna).is_err());
    assert!(parser.energy_scale().is_none());

    let unit = response(0x72, &[(0xe1, &[0x02])]);
    parser.absorb_energy_parameters(&unit).unwrap();
    let scale = parser.energy_scale().unwrap();
    assert_eq!(scale.coefficient, SM::Coefficient(1));
    assert_eq!(scale.accuracy_decimals(), 2);
}

#[test]
fn test_energy_parameters_sna_with_unit() {
    let mut parser = ReadingParser::new();
    // 0xd3 だけ値が無い Get_SNA
    let sna = response(0x52, &[(0xd3, &[]), (0xe1, &[0x01])]);
    parser.absorb_energy_parameters(&sna).unwrap();
    let scale = parser.energy_scale().unwrap();
    assert_eq!(scale.coefficient, SM::Coefficient(1));
    assert_eq!(scale.unit.0, Decimal::new(1, 1));

    let payload = response(0x72, &[(0xe0, &12345u32.to_be_bytes())]);
    let reading = parser
        .parse(&payload, MetricKind::Energy, Instant::now())
        .unwrap();
    assert_eq!(reading.value, Decimal::new(12345, 1));
}

#[test]
fn test_describe_notification() {
    let parser = ReadingParser::new();
    let edt = [0x07, 0xe9, 6, 1, 12, 30, 0, 0x00, 0x00, 0x30, 0x39];
    let payload = response(0x73, &[(0xea, &edt)]);
    let text = parser.describe(&payload).unwrap();
    assert!(text.starts_with("INFプロパティ値通知 N=1"));
    assert!(text.contains("2025-06-01 12:30:00"));
    let fixed = parser.fixed_time_notification(&payload).unwrap();
    assert_eq!(fixed.cumlative_amounts_power, 12345);
    // Get_Res は通知ではない
    assert!(matches!(
        parser.fixed_time_notification(&response(0x72, &[(0xea, &edt)])),
        Err(ParseError::UnexpectedEsv(0x72))
    ));

    // 係数も掛ける
    let mut parser = ReadingParser::new();
    let params = response(0x72, &[(0xd3, &[0, 0, 0, 10]), (0xe1, &[0x01])]);
    parser.absorb_energy_parameters(&params).unwrap();
    let text = parser.describe(&payload).unwrap();
    assert!(text.contains("12345.0 kwh"));
}
