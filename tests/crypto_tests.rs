//! Decryption end to end: fabricated ciphertexts through the full decoder,
//! plus the permanently-ignored bookkeeping on integrity failures.

use wmbusd::meters::{Driver, DriverTag, FieldValue, Meter, MeterRegistry};
use wmbusd::telegram::crypto::{
    aes_cbc_encrypt, aes_ctr_process, build_ell_iv, build_tpl_iv, crc16_en13757, AesKey,
};
use wmbusd::telegram::{Telegram, TelegramError};
use wmbusd::util::hex::decode_hex;

fn key() -> AesKey {
    AesKey::from_hex("000102030405060708090A0B0C0D0E0F").unwrap()
}

fn wrong_key() -> AesKey {
    AesKey::from_hex("FFEEDDCCBBAA99887766554433221100").unwrap()
}

/// Multical302 telegram under ELL AES-CTR, security bits set in the session
/// number, plaintext CRC ahead of the application layer.
fn ell_encrypted_frame() -> Vec<u8> {
    let manufacturer = 0x2C2D;
    let id = [0x78, 0x56, 0x34, 0x12];
    let version = 0x30;
    let device_type = 0x04;
    let cc = 0x20;
    // Security mode 1 lives in bits 13..16 of the session number.
    let sn = (1u32 << 13).to_le_bytes();

    let mut app = vec![0x78];
    app.extend_from_slice(
        &decode_hex("03062C000043060000000314630000426C7F2A022D130001FF2100").unwrap(),
    );

    let mut plaintext = crc16_en13757(&app).to_le_bytes().to_vec();
    plaintext.extend_from_slice(&app);

    let iv = build_ell_iv(manufacturer, id, version, device_type, cc, sn);
    let ciphertext = aes_ctr_process(&key(), &iv, &plaintext);

    let mut body = vec![0x44, 0x2D, 0x2C];
    body.extend_from_slice(&id);
    body.push(version);
    body.push(device_type);
    body.push(0x8D);
    body.push(cc);
    body.push(0x55); // acc
    body.extend_from_slice(&sn);
    body.extend_from_slice(&ciphertext);

    let mut frame = vec![body.len() as u8];
    frame.extend_from_slice(&body);
    frame
}

/// LansenPU telegram under TPL short header mode 5 (AES-CBC-IV), payload
/// leading with the 2F 2F marker and padded with idle fillers.
fn tpl_encrypted_frame() -> Vec<u8> {
    let manufacturer = 0x3033;
    let id = [0x99, 0x88, 0x77, 0x66];
    let version = 0x14;
    let device_type = 0x02;
    let acc = 0x77;

    let mut plaintext = vec![0x2F, 0x2F];
    plaintext.extend_from_slice(&decode_hex("0EFD3A2143650000008E40FD3A120000000000").unwrap());
    while plaintext.len() % 16 != 0 {
        plaintext.push(0x2F);
    }
    let blocks = plaintext.len() / 16;

    let iv = build_tpl_iv(manufacturer, id, version, device_type, acc);
    let ciphertext = aes_cbc_encrypt(&key(), &iv, &plaintext).unwrap();

    let mut body = vec![0x44, 0x33, 0x30];
    body.extend_from_slice(&id);
    body.push(version);
    body.push(device_type);
    body.push(0x7A);
    body.push(acc);
    body.push(0x00); // status
    body.push((blocks << 4) as u8); // cfg low: encrypted block count
    body.push(0x05); // cfg high: security mode 5
    body.extend_from_slice(&ciphertext);

    let mut frame = vec![body.len() as u8];
    frame.extend_from_slice(&body);
    frame
}

/// The same LansenPU content as a reconstructed wired M-Bus long-frame
/// payload: len C A CI, TPL long header in the clear, mode 5 ciphertext.
fn mbus_tpl_encrypted_payload() -> Vec<u8> {
    let manufacturer = 0x3033;
    let id = [0x99, 0x88, 0x77, 0x66];
    let version = 0x14;
    let device_type = 0x02;
    let acc = 0x33;

    let mut plaintext = vec![0x2F, 0x2F];
    plaintext.extend_from_slice(&decode_hex("0EFD3A2143650000008E40FD3A120000000000").unwrap());
    while plaintext.len() % 16 != 0 {
        plaintext.push(0x2F);
    }
    let blocks = plaintext.len() / 16;

    let iv = build_tpl_iv(manufacturer, id, version, device_type, acc);
    let ciphertext = aes_cbc_encrypt(&key(), &iv, &plaintext).unwrap();

    let mut body = vec![0x08, 0x01, 0x72]; // C A CI
    body.extend_from_slice(&id);
    body.extend_from_slice(&[0x33, 0x30]);
    body.push(version);
    body.push(device_type);
    body.push(acc);
    body.push(0x00); // status
    body.push((blocks << 4) as u8);
    body.push(0x05);
    body.extend_from_slice(&ciphertext);

    let mut payload = vec![body.len() as u8];
    payload.extend_from_slice(&body);
    payload
}

#[test]
fn ell_ctr_decrypts_to_readable_records() {
    let frame = ell_encrypted_frame();
    let t = Telegram::parse(&frame, Some(&key())).unwrap();
    assert_eq!(t.ci, 0x78);
    assert!(t.values.contains_key("0306"));
    assert!(t.values.contains_key("01FF21"));
}

#[test]
fn ell_ctr_wrong_key_fails_integrity() {
    let frame = ell_encrypted_frame();
    match Telegram::parse(&frame, Some(&wrong_key())) {
        Err(TelegramError::Integrity { id }) => assert_eq!(id, "12345678"),
        other => panic!("expected integrity failure, got {other:?}"),
    }
}

#[test]
fn ell_ctr_missing_key_is_reported() {
    let frame = ell_encrypted_frame();
    assert!(matches!(
        Telegram::parse(&frame, None),
        Err(TelegramError::MissingKey { .. })
    ));
}

#[test]
fn tpl_cbc_decrypts_to_readable_records() {
    let frame = tpl_encrypted_frame();
    let t = Telegram::parse(&frame, Some(&key())).unwrap();
    assert!(t.values.contains_key("0EFD3A"));
    assert!(t.values.contains_key("8E40FD3A"));
}

#[test]
fn tpl_cbc_wrong_key_fails_marker_check() {
    let frame = tpl_encrypted_frame();
    assert!(matches!(
        Telegram::parse(&frame, Some(&wrong_key())),
        Err(TelegramError::Integrity { .. })
    ));
}

#[test]
fn integrity_failure_permanently_ignores_address() {
    let mut registry = MeterRegistry::new();
    registry.add_meter(Meter::new(
        "pulse",
        DriverTag::LansenPu,
        vec!["66778899".to_string()],
        Some(wrong_key()),
    ));

    let frame = tpl_encrypted_frame();

    assert!(!registry.handle_telegram(&frame));
    assert!(registry.is_ignored("66778899"));
    assert_eq!(registry.meters()[0].num_updates(), 0);

    // The second bad telegram is dropped before any decode attempt.
    assert!(!registry.handle_telegram(&frame));
    assert_eq!(registry.meters()[0].num_updates(), 0);
}

#[test]
fn wired_mbus_mode5_decrypts_with_meter_key() {
    let mut registry = MeterRegistry::new();
    registry.add_meter(Meter::new(
        "pulse",
        DriverTag::LansenPu,
        vec!["66778899".to_string()],
        Some(key()),
    ));

    assert!(registry.handle_mbus_telegram(&mbus_tpl_encrypted_payload()));
    let meter = &registry.meters()[0];
    assert_eq!(meter.num_updates(), 1);
    assert_eq!(
        meter.driver().value_of("counter_a"),
        Some(FieldValue::Double(654321.0))
    );
}

#[test]
fn wired_mbus_integrity_failure_permanently_ignores() {
    let mut registry = MeterRegistry::new();
    registry.add_meter(Meter::new(
        "pulse",
        DriverTag::LansenPu,
        vec!["66778899".to_string()],
        Some(wrong_key()),
    ));

    let payload = mbus_tpl_encrypted_payload();
    assert!(!registry.handle_mbus_telegram(&payload));
    assert!(registry.is_ignored("66778899"));
    assert_eq!(registry.meters()[0].num_updates(), 0);

    // Dropped before any decode attempt the second time around.
    assert!(!registry.handle_mbus_telegram(&payload));
    assert_eq!(registry.meters()[0].num_updates(), 0);
}

#[test]
fn wired_mbus_missing_key_warns_without_ignoring() {
    let mut registry = MeterRegistry::new();
    registry.add_meter(Meter::new(
        "pulse",
        DriverTag::LansenPu,
        vec!["66778899".to_string()],
        None,
    ));

    let payload = mbus_tpl_encrypted_payload();
    assert!(!registry.handle_mbus_telegram(&payload));
    // A missing key is recoverable: the address is not poisoned and a
    // later telegram gets another chance.
    assert!(!registry.is_ignored("66778899"));
    assert!(!registry.handle_mbus_telegram(&payload));
    assert!(!registry.is_ignored("66778899"));
    assert_eq!(registry.meters()[0].num_updates(), 0);
}

#[test]
fn correct_key_after_ignore_is_still_ignored() {
    // Once poisoned, the address stays ignored for the process lifetime.
    let mut registry = MeterRegistry::new();
    registry.add_meter(Meter::new(
        "pulse",
        DriverTag::LansenPu,
        vec!["66778899".to_string()],
        Some(wrong_key()),
    ));
    let frame = tpl_encrypted_frame();
    registry.handle_telegram(&frame);
    assert!(registry.is_ignored("66778899"));

    let mut good = MeterRegistry::new();
    good.add_meter(Meter::new(
        "pulse",
        DriverTag::LansenPu,
        vec!["66778899".to_string()],
        Some(key()),
    ));
    assert!(good.handle_telegram(&frame));
    assert_eq!(good.meters()[0].num_updates(), 1);
}
