#![no_main]

use libfuzzer_sys::fuzz_target;
use trellis_proto::header::{self, FrameHeader};

fuzz_target!(|word: u32| {
    // unpack/pack must round-trip through the canonical form
    let header = FrameHeader::unpack(word);
    assert_eq!(header, FrameHeader::unpack(header.pack()));

    // a split word must survive a re-merge
    let (primary, secondary) = header::split(word);
    if let Some(secondary) = secondary {
        let (again, _) = header::split(header::merge(primary, secondary));
        assert_eq!(primary, again);
    }
});
