use portmux_detect::{
    classify, parse_socks4_request, parse_socks5_greeting, ProtocolClass, SOCKS5_AUTH_GSSAPI,
    SOCKS5_AUTH_NONE, SOCKS5_AUTH_PASSWORD,
};
use proptest::prelude::*;

fn user_id_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-zA-Z0-9_-]{0,32}").expect("valid user id regex")
}

fn socks4_probe(port: u16, ip: [u8; 4], user_id: &str) -> Vec<u8> {
    let mut probe = vec![0x04, 0x01];
    probe.extend_from_slice(&port.to_be_bytes());
    probe.extend_from_slice(&ip);
    probe.extend_from_slice(user_id.as_bytes());
    probe.push(0x00);
    probe
}

proptest! {
    #[test]
    fn complete_socks4_probes_classify_and_round_trip(
        port in 1_u16..=u16::MAX,
        ip in prop::array::uniform4(1_u8..=255),
        user_id in user_id_strategy(),
    ) {
        let probe = socks4_probe(port, ip, &user_id);
        prop_assert_eq!(classify(&probe), Some(ProtocolClass::Socks4));
        let request = parse_socks4_request(&probe).expect("probe parses");
        prop_assert_eq!(request.port, port);
        prop_assert_eq!(request.user_id, user_id);
    }

    #[test]
    fn socks4_probe_with_trailing_bytes_never_classifies_as_socks(
        port in 1_u16..=u16::MAX,
        ip in prop::array::uniform4(1_u8..=255),
        user_id in user_id_strategy(),
        trailer in prop::collection::vec(any::<u8>(), 1..16),
    ) {
        let mut probe = socks4_probe(port, ip, &user_id);
        probe.extend_from_slice(&trailer);
        prop_assert!(parse_socks4_request(&probe).is_none());
        let class = classify(&probe);
        prop_assert_ne!(class, Some(ProtocolClass::Socks4));
        prop_assert_ne!(class, Some(ProtocolClass::Socks5));
    }

    #[test]
    fn exact_socks5_greetings_classify(
        methods in prop::collection::vec(
            prop::sample::select(vec![SOCKS5_AUTH_NONE, SOCKS5_AUTH_GSSAPI, SOCKS5_AUTH_PASSWORD]),
            1..8,
        ),
    ) {
        let mut probe = vec![0x05, methods.len() as u8];
        probe.extend_from_slice(&methods);
        prop_assert_eq!(classify(&probe), Some(ProtocolClass::Socks5));
        let greeting = parse_socks5_greeting(&probe).expect("greeting parses");
        prop_assert_eq!(greeting.methods, methods);
    }

    #[test]
    fn socks5_greeting_prefixes_are_undecidable_not_misclassified(
        methods in prop::collection::vec(
            prop::sample::select(vec![SOCKS5_AUTH_NONE, SOCKS5_AUTH_GSSAPI, SOCKS5_AUTH_PASSWORD]),
            2..8,
        ),
        cut in 1_usize..4,
    ) {
        let mut probe = vec![0x05, methods.len() as u8];
        probe.extend_from_slice(&methods);
        let cut = cut.min(probe.len() - 2);
        probe.truncate(probe.len() - cut);
        prop_assert_eq!(classify(&probe), None);
    }

    #[test]
    fn classification_is_deterministic(prefix in prop::collection::vec(any::<u8>(), 0..64)) {
        prop_assert_eq!(classify(&prefix), classify(&prefix));
    }
}
