#![no_main]
use btt_rs::core::layout::INFO_SIZE;
use btt_rs::{Btt, MemNamespace, NamespaceIo, MIN_SIZE};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

// Garbage over the info block and flog must never panic the open path
fuzz_target!(|data: &[u8]| {
    let ns = Arc::new(MemNamespace::new(MIN_SIZE as usize));
    let flogoff = {
        let btt = Btt::open(ns.clone(), MIN_SIZE, 512, [0; 16], 4).unwrap();
        btt.write(0, 1, &[0x5a; 512]).unwrap();
        btt.arena_stats()[0].flogoff
    };

    let len = data.len().min(INFO_SIZE);
    ns.write(0, &data[..len], 0).unwrap();
    if data.len() > INFO_SIZE {
        // spill the rest over the start of the flog
        let rest = &data[INFO_SIZE..data.len().min(INFO_SIZE + 4096)];
        ns.write(0, rest, flogoff).unwrap();
    }

    if let Ok(mut btt) = Btt::open(ns, MIN_SIZE, 512, [0; 16], 4) {
        let mut buf = [0u8; 512];
        let _ = btt.read(0, 1, &mut buf);
        let _ = btt.write(1, 2, &[1; 512]);
        let _ = btt.check();
    }
});
