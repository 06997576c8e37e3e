//! RTSP client behavior against a scripted speaker

mod common;

use common::{MockSpeaker, SpeakerConfig};
use raopcast::protocol::crypto::RaopRsaKey;
use raopcast::protocol::rtsp::{
    RtspClient, ERR_CHALLENGE_MISMATCH, STATUS_OK, STATUS_UNAUTHORIZED,
};
use std::net::TcpStream;

fn connect(port: u16) -> RtspClient {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    RtspClient::new(stream, "raopcast/0.1", 0x1122_3344_5566_7788, 42).unwrap()
}

#[test]
fn password_retry_uses_digest_with_mirrored_casing() {
    let speaker = MockSpeaker::start(SpeakerConfig {
        password: Some("pw".into()),
        nonce: "abcDEF".into(),
        ..SpeakerConfig::default()
    });

    let mut client = connect(speaker.port);

    // first attempt: no credentials yet
    let status = client.do_options(None).unwrap();
    assert_eq!(status, STATUS_UNAUTHORIZED);

    // second attempt carries the digest and succeeds
    client.set_password("pw");
    let status = client.do_options(None).unwrap();
    assert_eq!(status, STATUS_OK);

    let options = speaker.requests_of("OPTIONS");
    assert_eq!(options.len(), 2);
    assert!(options[0].header("Authorization").is_none());

    let auth = options[1].header("Authorization").unwrap();
    assert!(auth.starts_with("Digest username=\"iTunes\""));
    assert!(auth.contains("realm=\"raop\""));
    assert!(auth.contains("nonce=\"abcDEF\""));

    // the mixed-case nonce forces uppercase hex digests
    fn upper_md5(input: &str) -> String {
        md5::compute(input.as_bytes())
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect()
    }
    let ha1 = upper_md5("iTunes:raop:pw");
    let ha2 = upper_md5("OPTIONS:*");
    let expected = upper_md5(&format!("{ha1}:abcDEF:{ha2}"));
    assert!(auth.contains(&format!("response=\"{expected}\"")));

    speaker.stop();
}

#[test]
fn common_headers_on_every_request() {
    let speaker = MockSpeaker::start(SpeakerConfig::default());
    let mut client = connect(speaker.port);

    client.do_options(None).unwrap();
    client.do_options(None).unwrap();

    let options = speaker.requests_of("OPTIONS");
    assert_eq!(options.len(), 2);
    for (i, request) in options.iter().enumerate() {
        assert_eq!(request.uri, "*");
        assert_eq!(request.header("CSeq").unwrap(), (i + 1).to_string());
        assert_eq!(request.header("Active-Remote").unwrap(), "42");
        assert_eq!(
            request.header("Client-Instance").unwrap(),
            "1122334455667788"
        );
        assert_eq!(request.header("DACP-ID").unwrap(), "1122334455667788");
        assert_eq!(request.header("User-Agent").unwrap(), "raopcast/0.1");
    }

    speaker.stop();
}

#[test]
fn rsa_challenge_round_trip_succeeds() {
    let mut rng = rand::rngs::OsRng;
    let private = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let public = RaopRsaKey::from_public_key(private.to_public_key());

    let speaker = MockSpeaker::start(SpeakerConfig {
        challenge_key: Some(private),
        ..SpeakerConfig::default()
    });

    let mut client = connect(speaker.port);
    let status = client.do_options(Some(&public)).unwrap();
    assert_eq!(status, STATUS_OK);

    // the challenge header was sent unpadded
    let options = speaker.requests_of("OPTIONS");
    let challenge = options[0].header("Apple-Challenge").unwrap();
    assert!(!challenge.contains('='));

    speaker.stop();
}

#[test]
fn rsa_challenge_mismatch_yields_sentinel() {
    let mut rng = rand::rngs::OsRng;
    let private = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let public = RaopRsaKey::from_public_key(private.to_public_key());

    let speaker = MockSpeaker::start(SpeakerConfig {
        challenge_key: Some(private),
        corrupt_challenge: true,
        ..SpeakerConfig::default()
    });

    let mut client = connect(speaker.port);
    let status = client.do_options(Some(&public)).unwrap();
    assert_eq!(status, ERR_CHALLENGE_MISMATCH);

    speaker.stop();
}

#[test]
fn setup_parses_transport_and_latency() {
    let speaker = MockSpeaker::start(SpeakerConfig {
        jack_status: Some("disconnected".into()),
        ..SpeakerConfig::default()
    });

    let mut client = connect(speaker.port);
    client.do_announce("", "").unwrap();
    let (status, setup) = client.do_setup(6001, 6002).unwrap();

    assert_eq!(status, STATUS_OK);
    assert_eq!(setup.server_port, 53561);
    assert_eq!(setup.control_port, 53562);
    assert_eq!(setup.timing_port, 53563);
    assert_eq!(setup.audio_latency, Some(11025));
    assert_eq!(
        setup.jack_status,
        Some(raopcast::protocol::rtsp::AudioJackStatus::Disconnected)
    );

    // the SETUP advertised our ports in the transport header
    let setup_requests = speaker.requests_of("SETUP");
    let transport = setup_requests[0].header("Transport").unwrap();
    assert!(transport.contains("control_port=6001"));
    assert!(transport.contains("timing_port=6002"));
    assert!(transport.contains("mode=record"));

    // session id is reused on subsequent requests
    client.do_record(100, 200_000).unwrap();
    let record = &speaker.requests_of("RECORD")[0];
    assert_eq!(record.header("Session").unwrap(), "DEADBEEF");
    assert_eq!(record.header("Range").unwrap(), "npt=0-");
    assert_eq!(record.header("RTP-Info").unwrap(), "seq=100;rtptime=200000");

    speaker.stop();
}

#[test]
fn announce_carries_sdp_and_session_uri() {
    let speaker = MockSpeaker::start(SpeakerConfig::default());
    let mut client = connect(speaker.port);

    client.do_announce("S0VZ", "SVY").unwrap();

    let announce = &speaker.requests_of("ANNOUNCE")[0];
    assert!(announce.uri.starts_with("rtsp://"));
    assert_eq!(announce.header("Content-Type").unwrap(), "application/sdp");

    let body = String::from_utf8_lossy(&announce.body);
    assert!(body.contains("a=rtpmap:96 AppleLossless"));
    assert!(body.contains("a=fmtp:96 352 0 16 40 10 14 2 255 0 0 44100"));
    assert!(body.contains("a=rsaaeskey:S0VZ"));
    assert!(body.contains("a=aesiv:SVY"));

    speaker.stop();
}

#[test]
fn teardown_only_after_record() {
    let speaker = MockSpeaker::start(SpeakerConfig::default());
    let mut client = connect(speaker.port);

    // no session yet: teardown is a local no-op
    assert_eq!(client.do_teardown().unwrap(), STATUS_OK);
    assert!(speaker.requests_of("TEARDOWN").is_empty());

    client.do_announce("", "").unwrap();
    client.do_setup(6001, 6002).unwrap();
    client.do_record(1, 2).unwrap();
    assert!(client.teardown_required());

    client.do_teardown().unwrap();
    assert_eq!(speaker.requests_of("TEARDOWN").len(), 1);
    assert!(!client.teardown_required());

    speaker.stop();
}

#[test]
fn get_and_set_parameter() {
    let speaker = MockSpeaker::start(SpeakerConfig::default());
    let mut client = connect(speaker.port);

    let (status, value) = client.do_get_parameter("volume").unwrap();
    assert_eq!(status, STATUS_OK);
    assert_eq!(value.as_deref(), Some("-20.000000"));

    client.do_set_parameter("volume", "-31.500000").unwrap();
    let set = &speaker.requests_of("SET_PARAMETER")[0];
    assert_eq!(set.header("Content-Type").unwrap(), "text/parameters");
    assert_eq!(
        String::from_utf8_lossy(&set.body),
        "volume: -31.500000\r\n"
    );

    client
        .do_set_parameter_data("image/none", &[], 123_456)
        .unwrap();
    let artwork = &speaker.requests_of("SET_PARAMETER")[1];
    assert_eq!(artwork.header("Content-Type").unwrap(), "image/none");
    assert_eq!(artwork.header("RTP-Info").unwrap(), "rtptime=123456");

    speaker.stop();
}
