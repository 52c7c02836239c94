// SKSTACK/IPの応答
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use std::net::Ipv6Addr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub code: u8,
    pub sender: Ipv6Addr,
    pub param: Option<u8>,
}

impl Event {
    pub const RECEIVED_BEACON: u8 = 0x20;
    pub const UDP_SENT: u8 = 0x21;
    pub const ACTIVE_SCAN_DONE: u8 = 0x22;
    pub const PANA_FAILED: u8 = 0x24;
    pub const PANA_CONNECTED: u8 = 0x25;
    pub const DISCONNECT_REQUESTED: u8 = 0x26;
    pub const PANA_CLOSED: u8 = 0x27;
    pub const PANA_CLOSE_TIMEOUT: u8 = 0x28;
    pub const SESSION_EXPIRED: u8 = 0x29;
    pub const TRANSMIT_LIMIT_ON: u8 = 0x32;
    pub const TRANSMIT_LIMIT_OFF: u8 = 0x33;

    /// イベント番号の説明
    pub fn describe(&self) -> &'static str {
        match (self.code, self.param) {
            (0x01, _) => "NS を受信した",
            (0x02, _) => "NA を受信した",
            (0x05, _) => "Echo Request を受信した",
            (0x1f, _) => "ED スキャンが完了した",
            (0x20, _) => "Beacon を受信した",
            (0x21, Some(0)) => "UDP の送信に成功",
            (0x21, Some(1)) => "UDP の送信に失敗",
            (0x21, Some(2)) => "UDP を送信する代わりにアドレス要請を行った",
            (0x21, _) => "UDP の送信処理が完了した",
            (0x22, _) => "アクティブスキャンが完了した",
            (0x24, _) => "PANA による接続過程でエラーが発生した（接続が完了しなかった）",
            (0x25, _) => "PANA による接続が完了した",
            (0x26, _) => "接続相手からセッション終了要求を受信した",
            (0x27, _) => "PANA セッションの終了に成功した",
            (0x28, _) => "PANA セッションの終了要求に対する応答がなくタイムアウトした（セッションは終了）",
            (0x29, _) => "セッションのライフタイムが経過して期限切れになった",
            (0x32, _) => "ARIB108 の送信総和時間の制限が発動した",
            (0x33, _) => "送信総和時間の制限が解除された",
            _ => "不明なイベント",
        }
    }

    /// PANAセッションが失われたことを示すイベント
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self.code,
            Self::PANA_FAILED
                | Self::DISCONNECT_REQUESTED
                | Self::PANA_CLOSED
                | Self::PANA_CLOSE_TIMEOUT
                | Self::SESSION_EXPIRED
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Epandesc {
    pub channel: u8,
    pub channel_page: u8,
    pub pan_id: u16,
    pub addr: u64,
    pub lqi: u8,
    pub pair_id: u32,
}

impl Epandesc {
    /// MACアドレスからIPv6リンクローカルアドレスへ変換する
    pub fn link_local_address(&self) -> Ipv6Addr {
        // MACアドレスの最初の1バイト下位2bit目を反転して
        // 0xFE80000000000000XXXXXXXXXXXXXXXXのXXをMACアドレスに置き換える
        Ipv6Addr::from_bits(
            0xFE80_0000_0000_0000u128 << 64 | (self.addr as u128 ^ 0x0200_0000_0000_0000u128),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erxudp {
    pub sender: Ipv6Addr,      // 送信元IPv6アドレス
    pub destination: Ipv6Addr, // 送信先IPv6アドレス
    pub sender_port: u16,      // 送信元UDPポート番号
    pub destination_port: u16, // 送信先UDPポート番号
    pub senderlla: u64,        // 送信元のMAC層アドレス
    pub secured: u8,           // 1:暗号化あり, 0:暗号化なし
    pub datalen: u16,          // 受信データ長
    pub data: Vec<u8>,         // 受信データ
}

impl Erxudp {
    /// UDPポート番号 0E1A = 3610 は Echonetliteメッセージ
    pub const ECHONETLITE_PORT: u16 = 0x0e1a;
    /// UDPポート番号 02CC = 716 は PANAメッセージ(RFC5191)
    pub const PANA_PORT: u16 = 0x02cc;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkRxD {
    Event(Event),       // イベント受信
    Epandesc(Epandesc), // EPANDESC受信
    Erxudp(Erxudp),     // ERXUDP受信
    Ever(String),       // EVER バージョン
    Echo(String),       // コマンドのエコーバック
    Fail(u8),           // 失敗
    OkWith(String),     // 成功(値つき)
    Ok,                 // 成功
    Void,               // 空行
}

#[test]
fn test_link_local_address() {
    let epandesc = Epandesc {
        channel: 0x3b,
        channel_page: 9,
        pan_id: 0xabcd,
        addr: 0x001D_1290_1234_5678,
        lqi: 0x84,
        pair_id: 0x1234_abcd,
    };
    assert_eq!(
        epandesc.link_local_address(),
        "FE80:0000:0000:0000:021D:1290:1234:5678"
            .parse::<Ipv6Addr>()
            .unwrap()
    );
}

#[test]
fn test_session_lost() {
    let sender: Ipv6Addr = "FE80::1".parse().unwrap();
    let event = |code| Event {
        code,
        sender,
        param: None,
    };
    assert!(event(Event::SESSION_EXPIRED).is_session_lost());
    assert!(event(Event::PANA_CLOSED).is_session_lost());
    assert!(!event(Event::PANA_CONNECTED).is_session_lost());
    assert!(!event(Event::TRANSMIT_LIMIT_ON).is_session_lost());
}
