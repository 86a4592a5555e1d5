#![no_main]
use arbitrary::Arbitrary;
use btt_rs::{Btt, MemNamespace, MIN_SIZE};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Op {
    Write { lane: u8, lba: u16, fill: u8 },
    Read { lane: u8, lba: u16 },
    Zero { lane: u8, lba: u16 },
    Error { lane: u8, lba: u16 },
}

fuzz_target!(|ops: Vec<Op>| {
    let btt = Btt::open(MemNamespace::new(MIN_SIZE as usize), MIN_SIZE, 512, [0; 16], 4)
        .unwrap();
    let mut buf = [0u8; 512];

    for op in ops.iter().take(256) {
        // out-of-range lanes and lbas must fail cleanly, never panic
        let _ = match *op {
            Op::Write { lane, lba, fill } => btt.write(lane as usize, lba as u64, &[fill; 512]),
            Op::Read { lane, lba } => btt.read(lane as usize, lba as u64, &mut buf),
            Op::Zero { lane, lba } => btt.set_zero(lane as usize, lba as u64),
            Op::Error { lane, lba } => btt.set_error(lane as usize, lba as u64),
        };
    }

    let mut btt = btt;
    let report = btt.check().unwrap();
    assert!(report.is_consistent());
});
