//! Bus routing, block installation, and trap layering.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use emu286::{BlockKind, Bus, BusConfig, KindMask, MemoryBlock, TrapFn};

fn small_bus() -> Bus {
    Bus::new(BusConfig {
        addr_width: 16,
        data_width: 8,
        block_size: 1024,
    })
    .unwrap()
}

#[test]
fn ram_round_trip_and_none_sentinel() {
    let mut bus = small_bus();
    bus.add_blocks(0x2000, 1024, BlockKind::Ram, None).unwrap();

    bus.write_data(0x2050, 0xAB, None);
    assert_eq!(bus.read_data(0x2050, None), 0xAB);

    // Unpopulated space reads all-ones and swallows writes.
    assert_eq!(bus.read_data(0x3050, None), 0xFF);
    bus.write_data(0x3050, 0x12, None);
    assert_eq!(bus.read_data(0x3050, None), 0xFF);
}

#[test]
fn routing_matches_block_indexing() {
    let mut bus = small_bus();
    bus.add_blocks(0, 0x10000, BlockKind::Ram, None).unwrap();

    for addr in [0u32, 1, 0x03FF, 0x0400, 0x7FFF, 0xFFFF] {
        bus.write_data(addr, (addr & 0xFF) as u16, None);
    }
    for addr in [0u32, 1, 0x03FF, 0x0400, 0x7FFF, 0xFFFF] {
        let block = bus.block_at(addr);
        let direct = block.borrow().peek(addr & 0x03FF);
        assert_eq!(bus.read_data(addr, None), direct);
        assert_eq!(direct, (addr & 0xFF) as u16);
    }
}

#[test]
fn add_blocks_rejects_occupied_regions_without_mutation() {
    let mut bus = small_bus();
    bus.add_blocks(0x2000, 2048, BlockKind::Ram, None).unwrap();
    bus.write_data(0x2100, 0x5A, None);

    // Overlaps the second RAM block.
    let err = bus.add_blocks(0x2400, 2048, BlockKind::Rom, None);
    assert!(err.is_err());

    // Nothing moved: the old contents are intact and the tail is still
    // unpopulated.
    assert_eq!(bus.read_data(0x2100, None), 0x5A);
    assert_eq!(bus.read_data(0x2C00, None), 0xFF);
}

#[test]
fn donor_block_of_matching_size_is_shared() {
    let mut bus = small_bus();
    let donor = Rc::new(RefCell::new(MemoryBlock::new(
        0x4000,
        1024,
        BlockKind::Rom,
        8,
    )));
    donor.borrow_mut().fill(0, &[0xEA, 0x12, 0x34]);

    // The same block backs two separate ranges.
    bus.add_blocks(0x4000, 1024, BlockKind::Rom, Some(&donor))
        .unwrap();
    bus.add_blocks(0x8000, 1024, BlockKind::Rom, Some(&donor))
        .unwrap();

    assert_eq!(bus.read_data(0x4000, None), 0xEA);
    assert_eq!(bus.read_data(0x8001, None), 0x12);
    assert!(Rc::ptr_eq(bus.block_at(0x4000), bus.block_at(0x8000)));
}

#[test]
fn donor_block_of_other_size_is_copied() {
    let mut bus = small_bus();
    let donor = Rc::new(RefCell::new(MemoryBlock::new(0, 16, BlockKind::Rom, 8)));
    let values: Vec<u8> = (0u8..16).collect();
    donor.borrow_mut().fill(0, &values);

    bus.add_blocks(0x1000, 16, BlockKind::Rom, Some(&donor))
        .unwrap();
    for i in 0..16u32 {
        assert_eq!(bus.read_data(0x1000 + i, None), i as u16);
    }
    assert!(!Rc::ptr_eq(bus.block_at(0x1000), &donor));
}

#[test]
fn clean_blocks_reports_and_clears_dirty() {
    let mut bus = small_bus();
    bus.add_blocks(0x2000, 2048, BlockKind::Ram, None).unwrap();

    assert!(bus.clean_blocks(0x2000, 2048));
    bus.write_data(0x2400, 1, None);
    assert!(!bus.clean_blocks(0x2000, 2048));
    // The walk above cleared the flag.
    assert!(bus.clean_blocks(0x2000, 2048));
}

#[test]
fn enum_blocks_filters_by_kind() {
    let mut bus = small_bus();
    bus.add_blocks(0x0000, 2048, BlockKind::Ram, None).unwrap();
    bus.add_blocks(0x4000, 1024, BlockKind::Rom, None).unwrap();
    bus.add_blocks(0x8000, 1024, BlockKind::Video, None).unwrap();

    let mut count = 0;
    assert_eq!(
        bus.enum_blocks(KindMask::RAM, |_| count += 1),
        2
    );
    assert_eq!(count, 2);
    assert_eq!(bus.enum_blocks(KindMask::ROM | KindMask::VIDEO, |_| {}), 2);
    // NONE padding never shows up.
    assert_eq!(bus.enum_blocks(KindMask::all(), |_| {}), 4);
}

#[test]
fn read_trap_observes_the_value_read() {
    let mut bus = small_bus();
    bus.add_blocks(0x2000, 1024, BlockKind::Ram, None).unwrap();
    bus.write_data(0x2050, 0x7E, None);

    let seen: Rc<Cell<Option<(u32, u16)>>> = Rc::new(Cell::new(None));
    let record = Rc::clone(&seen);
    let trap: TrapFn = Rc::new(move |addr, value, _pc| record.set(Some((addr, value))));

    assert!(bus.trap_read(0x2050, &trap));
    assert_eq!(bus.read_data(0x2050, None), 0x7E);
    assert_eq!(seen.get(), Some((0x2050, 0x7E)));
}

#[test]
fn write_trap_fires_before_the_store() {
    let mut bus = small_bus();
    bus.add_blocks(0x2000, 1024, BlockKind::Ram, None).unwrap();
    bus.write_data(0x2050, 0x11, None);

    let calls = Rc::new(Cell::new(0u32));
    let record = Rc::clone(&calls);
    let trap: TrapFn = Rc::new(move |addr, value, _pc| {
        assert_eq!(addr, 0x2050);
        assert_eq!(value, 0xCC);
        record.set(record.get() + 1);
    });

    assert!(bus.trap_write(0x2050, &trap));
    bus.write_data(0x2050, 0xCC, None);
    assert_eq!(calls.get(), 1);
    assert_eq!(bus.read_data(0x2050, None), 0xCC);
}

#[test]
fn trap_is_transparent_after_untrap() {
    let mut bus = small_bus();
    bus.add_blocks(0x2000, 1024, BlockKind::Ram, None).unwrap();
    bus.write_data(0x2010, 0x42, None);

    let calls = Rc::new(Cell::new(0u32));
    let record = Rc::clone(&calls);
    let trap: TrapFn = Rc::new(move |_, _, _| record.set(record.get() + 1));

    assert!(bus.trap_read(0x2010, &trap));
    bus.read_data(0x2010, None);
    assert!(bus.untrap_read(0x2010, &trap));

    assert_eq!(bus.read_data(0x2010, None), 0x42);
    assert_eq!(calls.get(), 1);
    assert!(!bus.block_at(0x2010).borrow().is_read_trapped());
    // Removing again has nothing to remove.
    assert!(!bus.untrap_read(0x2010, &trap));
}

#[test]
fn trap_reference_counting_stacks_identical_callbacks() {
    let mut bus = small_bus();
    bus.add_blocks(0x2000, 1024, BlockKind::Ram, None).unwrap();

    let calls = Rc::new(Cell::new(0u32));
    let record = Rc::clone(&calls);
    let trap: TrapFn = Rc::new(move |_, _, _| record.set(record.get() + 1));

    assert!(bus.trap_read(0x2000, &trap));
    assert!(bus.trap_read(0x2000, &trap));
    assert!(bus.untrap_read(0x2000, &trap));

    // One reference remains: the trap still fires.
    bus.read_data(0x2000, None);
    assert_eq!(calls.get(), 1);

    assert!(bus.untrap_read(0x2000, &trap));
    bus.read_data(0x2000, None);
    assert_eq!(calls.get(), 1);
}

#[test]
fn second_distinct_callback_is_rejected() {
    let mut bus = small_bus();
    bus.add_blocks(0x2000, 1024, BlockKind::Ram, None).unwrap();

    let first: TrapFn = Rc::new(|_, _, _| {});
    let second: TrapFn = Rc::new(|_, _, _| {});

    assert!(bus.trap_read(0x2000, &first));
    // Same block, different callback: refused even at another address.
    assert!(!bus.trap_read(0x2200, &second));
    assert!(bus.trap_read(0x2200, &first));
}

#[test]
fn traps_on_unpopulated_space_are_refused() {
    let mut bus = small_bus();
    let trap: TrapFn = Rc::new(|_, _, _| {});
    assert!(!bus.trap_read(0x9000, &trap));
    assert!(!bus.trap_write(0x9000, &trap));
}

#[test]
fn annotation_reaches_the_callback() {
    let mut bus = small_bus();
    bus.add_blocks(0, 1024, BlockKind::Ram, None).unwrap();

    let seen = Rc::new(Cell::new(None));
    let record = Rc::clone(&seen);
    let trap: TrapFn = Rc::new(move |_, _, pc| record.set(pc));

    assert!(bus.trap_read(0x10, &trap));
    bus.read_data(0x10, Some(0xF1234));
    assert_eq!(seen.get(), Some(0xF1234));
}

#[test]
fn snapshot_restores_ram_contents() {
    let mut bus = small_bus();
    bus.add_blocks(0x2000, 1024, BlockKind::Ram, None).unwrap();
    bus.write_data(0x2050, 0x99, None);

    let state = bus.save();
    bus.write_data(0x2050, 0x01, None);
    bus.restore(&state);
    assert_eq!(bus.read_data(0x2050, None), 0x99);
}

#[test]
fn rom_initial_values_survive_cpu_writes() {
    let mut bus = small_bus();
    bus.add_blocks(0xF000, 4096, BlockKind::Rom, None).unwrap();
    bus.poke(0xF000, 0xEA);

    bus.write_data(0xF000, 0x00, None);
    assert_eq!(bus.read_data(0xF000, None), 0xEA);
}
