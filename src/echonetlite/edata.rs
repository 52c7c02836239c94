// Echonetlite EDATA
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::echonetlite::smart_electric_energy_meter as SM;
use bincode::de::read::BorrowReader;
use core::result;
use std::fmt;

#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct EchonetliteEdata<'a> {
    pub epc: u8,
    pub pdc: u8,
    pub edt: &'a [u8],
}

impl<'a> EchonetliteEdata<'a> {
    /// get要求用(PDC=0)
    pub fn request(epc: u8) -> Self {
        Self {
            epc,
            ..Default::default()
        }
    }

    pub fn show(&self, opt_scale: Option<&SM::EnergyScale>) -> String {
        match SM::Properties::try_from(self.clone()) {
            Ok(a) => a.show(opt_scale),
            Err(_) => format!(
                "UNKNOWN EPC:0x{:02X}, EDT:[{}]",
                self.epc,
                self.edt
                    .iter()
                    .map(|x| format!("0x{:02X}", x))
                    .collect::<Vec<String>>()
                    .join(",")
            ),
        }
    }
}

impl<'a, 'de: 'a, Context> bincode::BorrowDecode<'de, Context> for EchonetliteEdata<'a> {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de, Context = Context>>(
        decoder: &mut D,
    ) -> core::result::Result<Self, bincode::error::DecodeError> {
        let epc: u8 = bincode::BorrowDecode::borrow_decode(decoder)?;
        let pdc: u8 = bincode::BorrowDecode::borrow_decode(decoder)?;
        decoder.claim_bytes_read(pdc as usize)?;
        let edt = decoder.borrow_reader().take_bytes(pdc as usize)?;
        Ok(Self { epc, pdc, edt })
    }
}

impl<'a> bincode::Encode for EchonetliteEdata<'a> {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        // PDCはEDTの長さと一致させる
        if self.pdc as usize != self.edt.len() {
            return Err(bincode::error::EncodeError::Other(
                "PDC does not match the length of EDT",
            ));
        }
        bincode::Encode::encode(&self.epc, encoder)?;
        bincode::Encode::encode(&self.pdc, encoder)?;
        for v in self.edt {
            bincode::Encode::encode(v, encoder)?;
        }
        Ok(())
    }
}

impl<'a> fmt::Display for EchonetliteEdata<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.show(None))
    }
}

#[test]
fn test1() {
    let e7 = EchonetliteEdata {
        epc: 0xe7,
        pdc: 4,
        edt: &[0, 0, 0x03, 0xe8],
    };

    let binary: Vec<u8> = vec![0xe7, 0x04, 0x00, 0x00, 0x03, 0xe8];
    let encoded = bincode::encode_to_vec(&e7, crate::echonetlite::bincode_config()).unwrap();
    assert_eq!(encoded, binary);

    let (decoded, _len): (EchonetliteEdata, usize) =
        bincode::borrow_decode_from_slice(&encoded[..], crate::echonetlite::bincode_config())
            .unwrap();
    assert_eq!(e7, decoded);
    assert!(decoded.to_string().contains("1000 W"));
}

#[test]
fn test_pdc_mismatch() {
    let broken = EchonetliteEdata {
        epc: 0xe7,
        pdc: 2,
        edt: &[1, 2, 3, 4],
    };
    assert!(bincode::encode_to_vec(&broken, crate::echonetlite::bincode_config()).is_err());
    assert_eq!(EchonetliteEdata::request(0xe0).pdc, 0);
}
