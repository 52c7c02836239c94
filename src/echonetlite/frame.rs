// Echonetlite FRAME
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::echonetlite::EchonetliteEdata;
use core::result;
use std::fmt;

/// Echonetliteフレームはビッグエンディアン固定長整数
pub fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct EchonetliteFrame<'a> {
    pub ehd: u16,
    pub tid: u16,
    pub seoj: [u8; 3],
    pub deoj: [u8; 3],
    pub esv: u8,
    pub opc: u8,
    pub edata: Vec<EchonetliteEdata<'a>>,
}

impl<'a> EchonetliteFrame<'a> {
    pub const EHD: u16 = 0x1081; // 0x1081 = echonet lite 電文形式1
    pub const EOJ_CONTROLLER: [u8; 3] = [0x05, 0xff, 0x01]; // home controller
    pub const EOJ_SMART_METER: [u8; 3] = [0x02, 0x88, 0x01]; // smartmeter
    pub const ESV_GET_SNA: u8 = 0x52;
    pub const ESV_GET: u8 = 0x62;
    pub const ESV_GET_RES: u8 = 0x72;
    pub const ESV_INF: u8 = 0x73;

    /// スマートメーターへのget要求
    pub fn get_request(tid: u16, epcs: &[u8]) -> Self {
        EchonetliteFrame {
            ehd: Self::EHD,
            tid,
            seoj: Self::EOJ_CONTROLLER,
            deoj: Self::EOJ_SMART_METER,
            esv: Self::ESV_GET,
            opc: epcs.len() as u8,
            edata: epcs.iter().map(|epc| EchonetliteEdata::request(*epc)).collect(),
        }
    }

    /// バイト列にする
    pub fn encode(&self) -> result::Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode_config())
    }

    /// バイト列から取り出す
    pub fn decode(data: &'a [u8]) -> result::Result<Self, bincode::error::DecodeError> {
        bincode::borrow_decode_from_slice(data, bincode_config()).map(|(frame, _len)| frame)
    }

    /// 送信元が低圧スマート電力量メータクラス(0x0288)か
    pub fn is_from_smart_meter(&self) -> bool {
        self.seoj[..2] == Self::EOJ_SMART_METER[..2]
    }

    /// プロパティを探す
    pub fn find(&self, epc: u8) -> Option<&EchonetliteEdata<'a>> {
        self.edata.iter().find(|edata| edata.epc == epc)
    }

    pub fn show(&self) -> String {
        match self.esv {
            // Get_SNA
            0x52 => format!("Get_SNAプロパティ値読み出し不可応答 N={}", self.opc),
            // Get
            0x62 => format!("Getプロパティ値読み出し要求 N={}", self.opc),
            // Get_res
            0x72 => format!("Get_resプロパティ値読み出し応答 N={}", self.opc),
            // INF
            0x73 => format!("INFプロパティ値通知 N={}", self.opc),
            // INFC
            0x74 => format!("INFCプロパティ値通知(応答要) N={}", self.opc),
            _ => format!(
                "よくわからないESV値 ESV=0x{:02X} N={} frame={}",
                self.esv,
                self.opc,
                self.encode()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| format!("{:02X}", n))
                    .collect::<String>()
            ),
        }
    }
}

impl<'de, Context> bincode::BorrowDecode<'de, Context> for EchonetliteFrame<'de> {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de, Context = Context>>(
        decoder: &mut D,
    ) -> core::result::Result<Self, bincode::error::DecodeError> {
        let ehd: u16 = bincode::BorrowDecode::borrow_decode(decoder)?;
        let tid: u16 = bincode::BorrowDecode::borrow_decode(decoder)?;
        let seoj: [u8; 3] = bincode::BorrowDecode::borrow_decode(decoder)?;
        let deoj: [u8; 3] = bincode::BorrowDecode::borrow_decode(decoder)?;
        let esv: u8 = bincode::BorrowDecode::borrow_decode(decoder)?;
        let opc: u8 = bincode::BorrowDecode::borrow_decode(decoder)?;
        let mut edata: Vec<EchonetliteEdata> = Vec::with_capacity(opc as usize);
        for _idx in 0..opc {
            edata.push(bincode::BorrowDecode::borrow_decode(decoder)?);
        }
        Ok(Self {
            ehd,
            tid,
            seoj,
            deoj,
            esv,
            opc,
            edata,
        })
    }
}

impl<'a> bincode::Encode for EchonetliteFrame<'a> {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.ehd, encoder)?;
        bincode::Encode::encode(&self.tid, encoder)?;
        bincode::Encode::encode(&self.seoj, encoder)?;
        bincode::Encode::encode(&self.deoj, encoder)?;
        bincode::Encode::encode(&self.esv, encoder)?;
        bincode::Encode::encode(&self.opc, encoder)?;
        for v in &self.edata {
            bincode::Encode::encode(v, encoder)?;
        }
        Ok(())
    }
}

impl<'a> fmt::Display for EchonetliteFrame<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.show())
    }
}

#[test]
fn test1() {
    let frame = EchonetliteFrame::get_request(0x1234, &[0xe7]);

    let binary: Vec<u8> = vec![
        0x10, 0x81, //
        0x12, 0x34, //
        0x05, 0xff, 0x01, //
        0x02, 0x88, 0x01, //
        0x62, //
        0x01, //
        0xe7, 0x00, //
    ];

    let encoded = frame.encode().unwrap();
    assert_eq!(encoded.len(), 14);
    assert_eq!(encoded, binary);

    let decoded = EchonetliteFrame::decode(&encoded).unwrap();
    assert_eq!(frame, decoded);
}

#[test]
fn test_get_res() {
    // 瞬時電力計測値 Get_res
    let binary: Vec<u8> = vec![
        0x10, 0x81, 0x00, 0x07, //
        0x02, 0x88, 0x01, //
        0x05, 0xff, 0x01, //
        0x72, 0x01, //
        0xe7, 0x04, 0x00, 0x00, 0x01, 0xf4, //
    ];
    let frame = EchonetliteFrame::decode(&binary).unwrap();
    assert_eq!(frame.tid, 7);
    assert!(frame.is_from_smart_meter());
    assert_eq!(frame.find(0xe7).map(|e| e.edt), Some(&[0x00, 0x00, 0x01, 0xf4][..]));
    assert!(frame.find(0xe0).is_none());
    assert_eq!(frame.to_string(), "Get_resプロパティ値読み出し応答 N=1");
}

#[test]
fn test_truncated() {
    // PDC=4 なのにEDTが足りない
    let binary: Vec<u8> = vec![
        0x10, 0x81, 0x00, 0x07, 0x02, 0x88, 0x01, 0x05, 0xff, 0x01, 0x72, 0x01, 0xe7, 0x04, 0x00,
    ];
    assert!(EchonetliteFrame::decode(&binary).is_err());
}
