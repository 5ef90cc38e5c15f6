#[cfg(test)]
mod timing_tests {
    use scubus::{
        clock::{
            Clock, ClockEvent, CPU_CYCLES_PER_FRAME, CPU_CYCLES_PER_SCANLINE, HBLANK_START_CYCLE,
            SCANLINES_PER_FRAME, VBLANK_START_LINE,
        },
        Machine,
    };

    #[test]
    fn test_frame_timing() {
        let mut clock = Clock::new();

        let events = clock.tick(SCANLINES_PER_FRAME * CPU_CYCLES_PER_SCANLINE);

        assert!(events.contains(&ClockEvent::VBlankStart));
        assert!(events.contains(&ClockEvent::VBlankEnd));
        assert!(events.contains(&ClockEvent::FrameEnd));
        assert_eq!(clock.current_scanline(), 0);
        assert_eq!(clock.frame_count(), 1);
    }

    #[test]
    fn test_vblank_timing() {
        let mut clock = Clock::new();

        let events = clock.tick(VBLANK_START_LINE * CPU_CYCLES_PER_SCANLINE);

        assert_eq!(events.last(), Some(&ClockEvent::ScanlineStart(224)));
        assert!(events.contains(&ClockEvent::VBlankStart));
        assert!(!events.contains(&ClockEvent::VBlankEnd));
        assert_eq!(clock.current_scanline(), 224);
    }

    #[test]
    fn test_hblank_timing() {
        let mut clock = Clock::new();

        let events = clock.tick(HBLANK_START_CYCLE - 1);
        assert!(events.is_empty());

        let events = clock.tick(1);
        assert_eq!(events, vec![ClockEvent::HBlankStart]);
        assert_eq!(clock.scanline_cycle(), HBLANK_START_CYCLE);

        let events = clock.tick(CPU_CYCLES_PER_SCANLINE - HBLANK_START_CYCLE);
        assert!(!events.contains(&ClockEvent::HBlankStart));
        assert!(events.contains(&ClockEvent::HBlankEnd));
        assert_eq!(clock.current_scanline(), 1);
    }

    #[test]
    fn test_frame_progress() {
        let mut clock = Clock::new();
        assert_eq!(clock.frame_progress(), 0.0);

        clock.tick(CPU_CYCLES_PER_FRAME / 2);
        let progress = clock.frame_progress();
        assert!(
            progress > 0.49 && progress < 0.51,
            "Progress was {}",
            progress
        );

        let mut clock2 = Clock::new();
        clock2.tick(CPU_CYCLES_PER_FRAME - CPU_CYCLES_PER_SCANLINE);
        let progress2 = clock2.frame_progress();
        assert!(progress2 > 0.99, "Progress was {}", progress2);
    }

    #[test]
    fn test_machine_counts_one_hblank_per_line() {
        let mut machine = Machine::default();

        machine.step(3 * CPU_CYCLES_PER_SCANLINE);

        // HBlank-IN stays pending under the reset mask, so each line's
        // raise after the first is a duplicate
        let pending: Vec<u8> = machine
            .bus
            .scu
            .interrupts
            .pending()
            .iter()
            .map(|i| i.vector)
            .collect();
        assert_eq!(pending, vec![0x42]);
        assert_eq!(machine.get_cycles(), 3 * CPU_CYCLES_PER_SCANLINE as usize);
    }
}
