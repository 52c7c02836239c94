// Echonetlite 低圧スマートメータークラス
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::echonetlite::EchonetliteEdata;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use std::fmt;

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Properties {
    Coefficient(Coefficient),
    CumlativeAmountsPower(CumlativeAmountsPower),
    UnitForCumlativeAmountsPower(UnitForCumlativeAmountsPower),
    InstantiousPower(InstantiousPower),
    CumlativeAmountsOfPowerAtFixedTime(CumlativeAmountsOfPowerAtFixedTime),
}

impl Properties {
    pub fn show(&self, opt_scale: Option<&EnergyScale>) -> String {
        match self {
            Self::Coefficient(a) => format!("{}", a),
            Self::CumlativeAmountsPower(a) => a.show(opt_scale),
            Self::UnitForCumlativeAmountsPower(a) => format!("{}", a),
            Self::InstantiousPower(a) => format!("{}", a),
            Self::CumlativeAmountsOfPowerAtFixedTime(a) => a.show(opt_scale),
        }
    }
}

impl<'a> TryFrom<EchonetliteEdata<'a>> for Properties {
    type Error = String;

    fn try_from(edata: EchonetliteEdata) -> Result<Self, Self::Error> {
        match edata.epc {
            Coefficient::EPC => Coefficient::try_from(edata).map(Properties::Coefficient),
            CumlativeAmountsPower::EPC => {
                CumlativeAmountsPower::try_from(edata).map(Properties::CumlativeAmountsPower)
            }
            UnitForCumlativeAmountsPower::EPC => UnitForCumlativeAmountsPower::try_from(edata)
                .map(Properties::UnitForCumlativeAmountsPower),
            InstantiousPower::EPC => {
                InstantiousPower::try_from(edata).map(Properties::InstantiousPower)
            }
            CumlativeAmountsOfPowerAtFixedTime::EPC => {
                CumlativeAmountsOfPowerAtFixedTime::try_from(edata)
                    .map(Properties::CumlativeAmountsOfPowerAtFixedTime)
            }
            _ => Err(format!("UNKNOWN EPC:0x{:X} EDT:{:?}", edata.epc, edata.edt)),
        }
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.show(None))
    }
}

/// 0xd3 係数
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Coefficient(pub u32);

impl Coefficient {
    pub const EPC: u8 = 0xd3; // 0xd3 係数
}

impl Default for Coefficient {
    // 値なしは × 1
    fn default() -> Self {
        Self(1)
    }
}

impl<'a> TryFrom<EchonetliteEdata<'a>> for Coefficient {
    type Error = String;

    fn try_from(edata: EchonetliteEdata) -> Result<Self, Self::Error> {
        if edata.epc == Self::EPC {
            match edata.edt {
                &[a, b, c, d] => match u32::from_be_bytes([a, b, c, d]) {
                    0 => Err(format!("BAD EPC:0x{:X} EDT:{:?}", edata.epc, edata.edt)),
                    n => Ok(Self(n)),
                },
                [] => Ok(Self::default()),
                _ => Err(format!("BAD EPC:0x{:X} EDT:{:?}", edata.epc, edata.edt)),
            }
        } else {
            Err(format!("BAD EPC:0x{:X}", edata.epc))
        }
    }
}

impl fmt::Display for Coefficient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "係数={}", self.0)
    }
}

/// 0xe0 積算電力量計測値(正方向計測値)
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CumlativeAmountsPower(pub u32);

impl CumlativeAmountsPower {
    pub const EPC: u8 = 0xe0; // 0xe0 積算電力量計測値(正方向計測値)

    pub fn show(&self, opt_scale: Option<&EnergyScale>) -> String {
        match opt_scale {
            Some(scale) => format!(
                "積算電力量計測値(正方向計測値)={:8} kwh",
                scale.kwh(self.0)
            ),
            None => format!("積算電力量計測値(正方向計測値)={:8}", self.0),
        }
    }
}

impl<'a> TryFrom<EchonetliteEdata<'a>> for CumlativeAmountsPower {
    type Error = String;

    fn try_from(edata: EchonetliteEdata) -> Result<Self, Self::Error> {
        match edata.edt {
            &[a, b, c, d] if edata.epc == Self::EPC => Ok(Self(u32::from_be_bytes([a, b, c, d]))),
            _ => Err(format!("BAD EPC:0x{:X} EDT:{:?}", edata.epc, edata.edt)),
        }
    }
}

impl fmt::Display for CumlativeAmountsPower {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.show(None))
    }
}

/// 0xe1 積算電力量単位(正方向、逆方向計測値)
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct UnitForCumlativeAmountsPower(pub Decimal);

impl UnitForCumlativeAmountsPower {
    pub const EPC: u8 = 0xe1; // 0xe1 積算電力量単位(正方向、逆方向計測値)

    /// 表示する小数点以下の桁数
    pub fn accuracy_decimals(&self, coefficient: &Coefficient) -> u32 {
        if self.0 >= Decimal::ONE {
            return 0;
        }
        // 0.1 kwh 単位で係数 1 なら 1 桁
        let digits = self.0.scale() as f64 - (coefficient.0 as f64).log10();
        digits.ceil().max(0.0) as u32
    }
}

impl<'a> TryFrom<EchonetliteEdata<'a>> for UnitForCumlativeAmountsPower {
    type Error = String;

    fn try_from(edata: EchonetliteEdata) -> Result<Self, Self::Error> {
        match edata.edt {
            [0x00] if edata.epc == Self::EPC => Ok(Self(Decimal::new(1, 0))), // 1.0 kwh
            [0x01] if edata.epc == Self::EPC => Ok(Self(Decimal::new(1, 1))), // 0.1 kwh
            [0x02] if edata.epc == Self::EPC => Ok(Self(Decimal::new(1, 2))), // 0.01 kwh
            [0x03] if edata.epc == Self::EPC => Ok(Self(Decimal::new(1, 3))), // 0.001 kwh
            [0x04] if edata.epc == Self::EPC => Ok(Self(Decimal::new(1, 4))), // 0.0001 kwh
            [0x0a] if edata.epc == Self::EPC => Ok(Self(Decimal::new(10, 0))), // 10 kwh
            [0x0b] if edata.epc == Self::EPC => Ok(Self(Decimal::new(100, 0))), // 100 kwh
            [0x0c] if edata.epc == Self::EPC => Ok(Self(Decimal::new(1000, 0))), // 1000 kwh
            [0x0d] if edata.epc == Self::EPC => Ok(Self(Decimal::new(10000, 0))), // 10000 kwh
            _ => Err(format!("BAD EPC:0x{:X} EDT:{:?}", edata.epc, edata.edt)),
        }
    }
}

impl fmt::Display for UnitForCumlativeAmountsPower {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "積算電力量単位(正方向、逆方向計測値)= {} kwh", self.0)
    }
}

/// 積算電力量の換算値(0xd3 係数と 0xe1 単位)
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct EnergyScale {
    pub unit: UnitForCumlativeAmountsPower,
    pub coefficient: Coefficient,
}

impl EnergyScale {
    pub fn accuracy_decimals(&self) -> u32 {
        self.unit.accuracy_decimals(&self.coefficient)
    }

    /// 積算電力量計測値を kwh にする
    pub fn kwh(&self, raw: u32) -> Decimal {
        Decimal::from(raw) * self.unit.0 * Decimal::from(self.coefficient.0)
    }
}

/// 0xe7 瞬時電力計測値
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct InstantiousPower(pub Decimal);

impl InstantiousPower {
    pub const EPC: u8 = 0xe7; // 0xe7 瞬時電力計測値
}

impl<'a> TryFrom<EchonetliteEdata<'a>> for InstantiousPower {
    type Error = String;

    fn try_from(edata: EchonetliteEdata) -> Result<Self, Self::Error> {
        match edata.edt {
            &[a, b, c, d] if edata.epc == Self::EPC => {
                Ok(Self(Decimal::new(
                    i32::from_be_bytes([a, b, c, d]) as i64,
                    0,
                ))) // マイナスの値もある
            }
            _ => Err(format!("BAD EPC:0x{:X} EDT:{:?}", edata.epc, edata.edt)),
        }
    }
}

impl fmt::Display for InstantiousPower {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "瞬時電力={:5} W", self.0)
    }
}

/// 0xea 定時積算電力量計測値(正方向計測値)
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CumlativeAmountsOfPowerAtFixedTime {
    pub time_point: NaiveDateTime,
    pub cumlative_amounts_power: u32,
}

impl CumlativeAmountsOfPowerAtFixedTime {
    pub const EPC: u8 = 0xea; // 0xea 定時積算電力量計測値(正方向計測値)

    pub fn show(&self, opt_scale: Option<&EnergyScale>) -> String {
        match opt_scale {
            Some(scale) => format!(
                "定時積算電力量計測値(正方向計測値)={} ({:8} kwh)",
                self.time_point.format("%Y-%m-%d %H:%M:%S"),
                scale.kwh(self.cumlative_amounts_power)
            ),
            None => format!(
                "定時積算電力量計測値(正方向計測値)={} ({:8})",
                self.time_point.format("%Y-%m-%d %H:%M:%S"),
                self.cumlative_amounts_power
            ),
        }
    }
}

impl<'a> TryFrom<EchonetliteEdata<'a>> for CumlativeAmountsOfPowerAtFixedTime {
    type Error = String;

    fn try_from(edata: EchonetliteEdata) -> Result<Self, Self::Error> {
        match edata.edt {
            &[
                year0,                // 年 2bytes
                year1,                //
                month,                // 月 1bytes
                day,                  // 日 1bytes
                hour,                 // 時 1bytes
                minute,               // 分 1bytes
                second,               // 秒 1bytes
                cumlative_watt_hour0, // 積算電力量 4bytes
                cumlative_watt_hour1, //
                cumlative_watt_hour2, //
                cumlative_watt_hour3, //
            ] if edata.epc == Self::EPC => {
                let year = u16::from_be_bytes([year0, year1]);
                let time_point = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                    .and_then(|a| a.and_hms_opt(hour as u32, minute as u32, second as u32))
                    .ok_or_else(|| format!("BAD DATETIME EDT:{:?}", edata.edt))?;
                let value = u32::from_be_bytes([
                    cumlative_watt_hour0,
                    cumlative_watt_hour1,
                    cumlative_watt_hour2,
                    cumlative_watt_hour3,
                ]);
                Ok(Self {
                    time_point,
                    cumlative_amounts_power: value,
                })
            }
            _ => Err(format!("BAD EPC:0x{:X} EDT:{:?}", edata.epc, edata.edt)),
        }
    }
}

impl fmt::Display for CumlativeAmountsOfPowerAtFixedTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.show(None))
    }
}

#[test]
fn test_instantious_power() {
    let edata = EchonetliteEdata {
        epc: InstantiousPower::EPC,
        pdc: 4,
        edt: &[0xff, 0xff, 0xff, 0x9c],
    };
    // 逆潮流はマイナス
    assert_eq!(
        InstantiousPower::try_from(edata),
        Ok(InstantiousPower(Decimal::new(-100, 0)))
    );

    let short = EchonetliteEdata {
        epc: InstantiousPower::EPC,
        pdc: 2,
        edt: &[0x01, 0xf4],
    };
    assert!(InstantiousPower::try_from(short).is_err());
}

#[test]
fn test_coefficient() {
    let empty = EchonetliteEdata::request(Coefficient::EPC);
    assert_eq!(Coefficient::try_from(empty), Ok(Coefficient(1)));

    let ten = EchonetliteEdata {
        epc: Coefficient::EPC,
        pdc: 4,
        edt: &[0, 0, 0, 10],
    };
    assert_eq!(Coefficient::try_from(ten), Ok(Coefficient(10)));

    let one_byte = EchonetliteEdata {
        epc: Coefficient::EPC,
        pdc: 1,
        edt: &[10],
    };
    assert!(Coefficient::try_from(one_byte).is_err());
}

#[test]
fn test_unit_accuracy() {
    let unit = |code: u8| {
        let edt = [code];
        UnitForCumlativeAmountsPower::try_from(EchonetliteEdata {
            epc: UnitForCumlativeAmountsPower::EPC,
            pdc: 1,
            edt: &edt,
        })
    };
    let tenth = unit(0x01).unwrap();
    assert_eq!(tenth.0, Decimal::new(1, 1));
    assert_eq!(tenth.accuracy_decimals(&Coefficient(1)), 1);
    assert_eq!(tenth.accuracy_decimals(&Coefficient(10)), 0);
    assert_eq!(unit(0x03).unwrap().accuracy_decimals(&Coefficient(1)), 3);
    assert_eq!(unit(0x0b).unwrap().accuracy_decimals(&Coefficient(1)), 0);
    assert!(unit(0x05).is_err());
}

#[test]
fn test_fixed_time() {
    let edt = [0x07, 0xe9, 6, 1, 12, 30, 0, 0x00, 0x00, 0x30, 0x39];
    let edata = EchonetliteEdata {
        epc: CumlativeAmountsOfPowerAtFixedTime::EPC,
        pdc: 11,
        edt: &edt,
    };
    let fixed = CumlativeAmountsOfPowerAtFixedTime::try_from(edata).unwrap();
    assert_eq!(fixed.cumlative_amounts_power, 12345);
    assert_eq!(
        fixed.time_point,
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .and_then(|d| d.and_hms_opt(12, 30, 0))
            .unwrap()
    );

    let scale = EnergyScale {
        unit: UnitForCumlativeAmountsPower(Decimal::new(1, 1)),
        coefficient: Coefficient(10),
    };
    // 12345 × 0.1 × 10
    assert!(fixed.show(Some(&scale)).contains("12345.0 kwh"));

    // 13月は無い
    let bad = [0x07, 0xe9, 13, 1, 12, 30, 0, 0x00, 0x00, 0x30, 0x39];
    assert!(
        CumlativeAmountsOfPowerAtFixedTime::try_from(EchonetliteEdata {
            epc: CumlativeAmountsOfPowerAtFixedTime::EPC,
            pdc: 11,
            edt: &bad,
        })
        .is_err()
    );
}
