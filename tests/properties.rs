//! Property tests for the Gree state frame.

use greeir2net::protocol::{
    message::{Command, Snapshot},
    state::{GreeState, Mode, AutoPosition, ManualPosition, STATE_LENGTH},
};
use packed_struct::PrimitiveEnum;
use proptest::prelude::*;

fn in_mode(mode: Mode) -> GreeState {
    let mut state = GreeState::default();
    state.set_mode(mode as u8);
    state
}

fn any_mode() -> impl Strategy<Value = Mode> {
    prop_oneof![
        Just(Mode::Auto),
        Just(Mode::Cool),
        Just(Mode::Dry),
        Just(Mode::Fan),
        Just(Mode::Heat),
    ]
}

/// Bits that take part in the block checksum, as (byte, mask).
/// Low nibbles of bytes 0-3, high nibbles of bytes 4-6.
fn checksummed_bit() -> impl Strategy<Value = (usize, u8)> {
    (0usize..STATE_LENGTH - 1, 0u32..4).prop_map(|(byte, bit)| {
        let bit = if byte < 4 { bit } else { bit + 4 };
        (byte, 1u8 << bit)
    })
}

// ── mode ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn mode_round_trips(mode in any_mode()) {
        let state = in_mode(mode);
        prop_assert_eq!(state.mode(), mode as u8);
        prop_assert_eq!(state.known_mode(), Some(mode));
    }

    #[test]
    fn unknown_mode_selects_auto(mode in any::<u8>().prop_filter("not a mode", |m| Mode::from_primitive(*m).is_none())) {
        let mut state = in_mode(Mode::Heat);
        state.set_mode(mode);
        prop_assert_eq!(state.mode(), Mode::Auto as u8);
        prop_assert_eq!(state.temperature(), 25);
    }
}

// ── temperature ───────────────────────────────────────────────

proptest! {
    #[test]
    fn temperature_clamped(
        mode in any_mode().prop_filter("not auto", |m| *m != Mode::Auto),
        celsius in any::<i32>(),
    ) {
        let mut state = in_mode(mode);
        state.set_temperature(celsius);
        prop_assert_eq!(i32::from(state.temperature()), celsius.clamp(16, 30));
    }

    #[test]
    fn temperature_in_range_kept(
        mode in any_mode().prop_filter("not auto", |m| *m != Mode::Auto),
        celsius in 16i32..=30,
    ) {
        let mut state = in_mode(mode);
        state.set_temperature(celsius);
        prop_assert_eq!(i32::from(state.temperature()), celsius);
    }

    #[test]
    fn auto_mode_locks_temperature(celsius in any::<i32>()) {
        let mut state = in_mode(Mode::Auto);
        state.set_temperature(celsius);
        prop_assert_eq!(state.temperature(), 25);
    }
}

// ── fan ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn dry_mode_locks_fan(speed in any::<i32>()) {
        let mut state = in_mode(Mode::Dry);
        state.set_fan_speed(speed);
        prop_assert_eq!(state.fan_speed(), 1);
    }

    #[test]
    fn fan_speed_clamped(
        mode in any_mode().prop_filter("not dry", |m| *m != Mode::Dry),
        speed in any::<i32>(),
    ) {
        let mut state = in_mode(mode);
        state.set_fan_speed(speed);
        prop_assert_eq!(i32::from(state.fan_speed()), speed.clamp(0, 3));
    }
}

// ── checksum ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn fixup_makes_checksum_valid(raw in any::<[u8; STATE_LENGTH]>()) {
        let mut state = GreeState::from_raw(raw);
        state.fixup();
        prop_assert!(state.has_valid_checksum());
    }

    #[test]
    fn single_bit_flip_detected(
        raw in any::<[u8; STATE_LENGTH]>(),
        (byte, mask) in checksummed_bit(),
    ) {
        let mut state = GreeState::from_raw(raw);
        let mut fixed = state.raw();
        fixed[byte] ^= mask;

        prop_assert!(!GreeState::from_raw(fixed).has_valid_checksum());
    }

    #[test]
    fn fixup_only_touches_checksum_nibble(raw in any::<[u8; STATE_LENGTH]>()) {
        let mut state = GreeState::from_raw(raw);
        let fixed = state.raw();

        prop_assert_eq!(&fixed[..STATE_LENGTH - 1], &raw[..STATE_LENGTH - 1]);
        prop_assert_eq!(fixed[STATE_LENGTH - 1] & 0x0f, raw[STATE_LENGTH - 1] & 0x0f);
    }
}

// ── swing ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn manual_swing_coerced(position in 0u8..16) {
        let mut state = GreeState::default();
        state.set_vertical_swing(false, position);

        let expected = match ManualPosition::from_primitive(position) {
            Some(valid) => valid as u8,
            None => ManualPosition::LastPosition as u8,
        };

        prop_assert!(!state.vertical_swing_auto());
        prop_assert_eq!(state.vertical_swing_position(), expected);
    }

    #[test]
    fn auto_swing_coerced(position in 0u8..16) {
        let mut state = GreeState::default();
        state.set_vertical_swing(true, position);

        let expected = match AutoPosition::from_primitive(position) {
            Some(valid) => valid as u8,
            None => AutoPosition::Auto as u8,
        };

        prop_assert!(state.vertical_swing_auto());
        prop_assert_eq!(state.vertical_swing_position(), expected);
    }

    #[test]
    fn swing_position_ignores_high_bits(automatic in any::<bool>(), position in 16u8..) {
        let mut state = GreeState::default();
        state.set_vertical_swing(automatic, position);

        let expected = if automatic { AutoPosition::Auto as u8 } else { ManualPosition::LastPosition as u8 };
        prop_assert_eq!(state.vertical_swing_position(), expected);
    }
}

// ── commands ──────────────────────────────────────────────────

proptest! {
    /// Whatever a well formed line says, the published snapshot obeys the
    /// frame rules.
    #[test]
    fn command_snapshot_consistent(
        power in any::<bool>(),
        mode in 0u8..10,
        celsius in 0u8..100,
        fan in 0u8..10,
        swing_auto in any::<bool>(),
        position in 0u8..10,
    ) {
        let line = format!(
            "{},{mode},{celsius:02},{fan},0,0,0,0,{},{position}\r",
            u8::from(power),
            u8::from(swing_auto),
        );

        let command = Command::parse(line.as_bytes()).unwrap();
        let mut state = GreeState::default();
        command.apply(&mut state);

        let snapshot = Snapshot::of(&state).to_string();
        let fields: Vec<i32> = snapshot.trim_end().split(',').map(|f| f.parse().unwrap()).collect();

        prop_assert_eq!(fields.len(), 10);
        prop_assert_eq!(fields[0], i32::from(power));
        prop_assert!(fields[1] <= 4);
        if fields[1] == Mode::Auto as i32 {
            prop_assert_eq!(fields[2], 25);
        } else {
            prop_assert_eq!(fields[2], i32::from(celsius).clamp(16, 30));
        }
        if fields[1] == Mode::Dry as i32 {
            prop_assert_eq!(fields[3], 1);
        }
    }
}
