// SKSTACK/IPの応答パーサー
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::skstack::{self, SkRxD};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::character::complete::{crlf, hex_digit1, not_line_ending, space0, space1};
use nom::combinator::{map, map_res, opt, recognize};
use nom::multi::{many0, separated_list1};
use nom::sequence::preceded;
use nom::{Parser, bytes};
use std::net::Ipv6Addr;

// 8ビット16進数(任意桁)
fn u8_hex_digit(input: &str) -> nom::IResult<&str, u8> {
    map_res(hex_digit1, |hexd| u8::from_str_radix(hexd, 16)).parse(input)
}

// 8ビット16進数(2桁固定)
fn u8_hex_digit2(input: &str) -> nom::IResult<&str, u8> {
    map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()), |s| {
        u8::from_str_radix(s, 16)
    })
    .parse(input)
}

// 16ビット16進数(任意桁)
fn u16_hex_digit(input: &str) -> nom::IResult<&str, u16> {
    map_res(hex_digit1, |hexd| u16::from_str_radix(hexd, 16)).parse(input)
}

// 64ビット16進数(任意桁)
fn u64_hex_digit(input: &str) -> nom::IResult<&str, u64> {
    map_res(hex_digit1, |hexd| u64::from_str_radix(hexd, 16)).parse(input)
}

// FAIL ERxx\r\n
fn rx_fail(input: &str) -> nom::IResult<&str, SkRxD> {
    let parser = (tag("FAIL ER"), u8_hex_digit2, crlf);
    map(parser, |(_tag, code, _crlf)| SkRxD::Fail(code)).parse(input)
}

// OK\r\n, OK 01\r\n
fn rx_ok(input: &str) -> nom::IResult<&str, SkRxD> {
    let parser = (tag("OK"), opt(preceded(space1, not_line_ending)), crlf);
    map(parser, |(_tag, value, _crlf): (&str, Option<&str>, &str)| {
        match value.map(str::trim) {
            Some(v) if !v.is_empty() => SkRxD::OkWith(v.to_owned()),
            _ => SkRxD::Ok,
        }
    })
    .parse(input)
}

// EVER 1.2.10\r\n
fn rx_ever(input: &str) -> nom::IResult<&str, SkRxD> {
    let parser = (tag("EVER"), space1, not_line_ending, crlf);
    map(parser, |(_tag, _sp, version, _crlf): (&str, &str, &str, &str)| {
        SkRxD::Ever(version.trim().to_owned())
    })
    .parse(input)
}

// SKxxxx ...\r\n (エコーバック)
fn rx_echo(input: &str) -> nom::IResult<&str, SkRxD> {
    let parser = (recognize((tag("SK"), not_line_ending)), crlf);
    map(parser, |(line, _crlf): (&str, &str)| SkRxD::Echo(line.to_owned())).parse(input)
}

// Ipv6アドレス(FE80:0000:0000:0000:0000:0000:0000:0000)
fn ipv6addr(s: &str) -> nom::IResult<&str, Ipv6Addr> {
    let parser = separated_list1(tag(":"), hex_digit1);
    map_res(parser, |xs: Vec<&str>| xs.join(":").parse::<Ipv6Addr>()).parse(s)
}

// EVENT xx FE80:0000:0000:0000:0000:0000:0000:0000 yy\r\n
fn rx_event(s: &str) -> nom::IResult<&str, SkRxD> {
    let (s, _) = tag("EVENT").parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, code) = u8_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, sender_address) = ipv6addr.parse(s)?;
    let (s, _) = space0.parse(s)?;
    let (s, param) = opt(u8_hex_digit).parse(s)?;
    let (s, _) = space0.parse(s)?;
    let (s, _) = crlf.parse(s)?;
    Ok((
        s,
        SkRxD::Event(skstack::Event {
            code,
            sender: sender_address,
            param,
        }),
    ))
}

// ERXUDP
fn rx_erxudp(s: &str) -> nom::IResult<&str, SkRxD> {
    let (s, _) = tag("ERXUDP").parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 送信元アドレス
    let (s, sender) = ipv6addr.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 送信先アドレス
    let (s, destination) = ipv6addr.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 送信元ポート番号
    let (s, sender_port) = u16_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 送信先ポート番号
    let (s, destination_port) = u16_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 送信元のMAC層アドレス
    let (s, senderlla) = u64_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 暗号化あり/なし
    let (s, secured) = u8_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 受信したデータの長さ
    let (s, datalen) = u16_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 受信データ(テキスト)
    let (s, data) = many0(u8_hex_digit2).parse(s)?;
    let (s, _) = space0.parse(s)?;
    let (s, _) = crlf.parse(s)?;

    let erxudp = skstack::Erxudp {
        sender,
        destination,
        sender_port,
        destination_port,
        senderlla,
        secured,
        datalen,
        data,
    };

    Ok((s, SkRxD::Erxudp(erxudp)))
}

// EPANDESC
fn rx_epandesc(s: &str) -> nom::IResult<&str, SkRxD> {
    // 1行目
    let (s, _) = (tag("EPANDESC"), crlf).parse(s)?;
    // 2行目
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, channel) = map((tag("Channel:"), u64_hex_digit, crlf), |(_, n, _)| n as u8).parse(s)?;
    // 3行目
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, channel_page) = map((tag("Channel Page:"), u64_hex_digit, crlf), |(_, n, _)| {
        n as u8
    })
    .parse(s)?;
    // 4行目
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, pan_id) = map((tag("Pan ID:"), u64_hex_digit, crlf), |(_, n, _)| n as u16).parse(s)?;
    // 5行目
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, (_, addr, _)) = (tag("Addr:"), u64_hex_digit, crlf).parse(s)?;
    // 6行目
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, lqi) = map((tag("LQI:"), u64_hex_digit, crlf), |(_, n, _)| n as u8).parse(s)?;
    // 7行目
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, pair_id) = map((tag("PairID:"), u64_hex_digit, crlf), |(_, n, _)| n as u32).parse(s)?;

    let epandesc = skstack::Epandesc {
        channel,
        channel_page,
        pan_id,
        addr,
        lqi,
        pair_id,
    };

    Ok((s, SkRxD::Epandesc(epandesc)))
}

/// 解析する
pub fn parse_rxd(input: &str) -> nom::IResult<&str, SkRxD> {
    alt((
        // 以下のどれか
        map((space0, crlf), |_| SkRxD::Void), // 空行
        rx_ok,                                // OK
        rx_fail,                              // FAIL
        rx_ever,                              // EVER
        rx_event,                             // EVENT
        rx_epandesc,                          // EPANDESC
        rx_erxudp,                            // ERXUDP
        rx_echo,                              // エコーバック
    ))
    .parse(input)
}

#[test]
fn test1() {
    assert_eq!(parse_rxd("\r\n").unwrap(), ("", SkRxD::Void));

    assert_eq!(parse_rxd(" \r\n").unwrap(), ("", SkRxD::Void));

    assert_eq!(parse_rxd("OK\r\n").unwrap(), ("", SkRxD::Ok));

    assert_eq!(
        parse_rxd("OK 01\r\n").unwrap(),
        ("", SkRxD::OkWith("01".to_owned()))
    );

    assert_eq!(parse_rxd("FAIL ER10\r\n").unwrap(), ("", SkRxD::Fail(16)));

    assert_eq!(
        parse_rxd("EVER 1.2.10\r\n").unwrap(),
        ("", SkRxD::Ever("1.2.10".to_owned()))
    );

    assert_eq!(
        parse_rxd("SKSREG SFE 0\r\n").unwrap(),
        ("", SkRxD::Echo("SKSREG SFE 0".to_owned()))
    );

    assert_eq!(u64_hex_digit("FF00").unwrap(), ("", 0xff00));

    assert!(parse_rxd("garbage\r\n").is_err());
}

#[test]
fn test2() {
    let sender = "FE80:0000:0000:0000:0000:0000:0000:0000";

    assert_eq!(
        parse_rxd(&format!("EVENT 02 {}\r\n", sender)).unwrap(),
        (
            "",
            SkRxD::Event(skstack::Event {
                code: 2,
                sender: sender.parse().unwrap(),
                param: None,
            })
        )
    );

    assert_eq!(
        parse_rxd(&format!("EVENT 21 {} 02\r\n", sender)).unwrap(),
        (
            "",
            SkRxD::Event(skstack::Event {
                code: 0x21,
                sender: sender.parse().unwrap(),
                param: Some(2),
            })
        )
    );

    assert_eq!(
        parse_rxd(&format!("EVENT 25 {}\r\n", sender)).unwrap(),
        (
            "",
            SkRxD::Event(skstack::Event {
                code: skstack::Event::PANA_CONNECTED,
                sender: sender.parse().unwrap(),
                param: None,
            })
        )
    );
}

#[test]
fn test3() {
    let sender: Ipv6Addr = "FE80:0001:0002:0003:0004:0005:0006:0007".parse().unwrap();
    let destination: Ipv6Addr = "FE80:0008:0009:000a:000b:000c:000d:000e".parse().unwrap();
    let senderlla = 0x1234_5678_9abc_0000u64;
    let datalen = 16;
    let data = "000102030405060708090A0B0C0D0E0F";
    let erxudp = format!(
        "ERXUDP {} {} 0E1A 0E1A {:X} 1 {:04X} {}\r\n",
        sender.segments().map(|n| format!("{:04X}", n)).join(":"),
        destination
            .segments()
            .map(|n| format!("{:04X}", n))
            .join(":"),
        senderlla,
        datalen,
        data
    );

    assert_eq!(
        parse_rxd(&erxudp).unwrap(),
        (
            "",
            SkRxD::Erxudp(skstack::Erxudp {
                sender,
                destination,
                sender_port: 0x0E1A,
                destination_port: 0x0E1A,
                senderlla,
                secured: 1,
                datalen,
                data: vec!(0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15),
            })
        )
    );
}

#[test]
fn test4() {
    let epandesc = vec![
        "EPANDESC\r\n",
        "  Channel:3B\r\n",
        "  Channel Page:09\r\n",
        "  Pan ID:ABCD\r\n",
        "  Addr:12345678ABCDABCD\r\n",
        "  LQI:84\r\n",
        "  PairID:1234ABCD\r\n",
    ];

    let expected = SkRxD::Epandesc(skstack::Epandesc {
        channel: 59,
        channel_page: 9,
        pan_id: 0xABCD,
        addr: 0x1234_5678_ABCD_ABCD,
        lqi: 132,
        pair_id: 0x1234_ABCD,
    });

    // 途中までの行は続きを要求する
    for n in 1..epandesc.len() {
        assert!(matches!(
            parse_rxd(&epandesc[..n].concat()),
            Err(nom::Err::Incomplete(_))
        ));
    }
    assert_eq!(parse_rxd(&epandesc.concat()).unwrap(), ("", expected));
}
