#![no_main]
use libfuzzer_sys::fuzz_target;
use utp_engine::Header;

fuzz_target!(|data: &[u8]| {
    // unmarshal() should never panic, and whatever it accepts must re-encode
    if let Ok((header, offset)) = Header::unmarshal(data) {
        assert!(offset <= data.len());
        let mut buf = vec![0u8; header.encoded_len()];
        let _ = header.marshal(&mut buf);
    }
});
