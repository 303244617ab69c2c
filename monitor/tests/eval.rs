//! Expression evaluator properties and end-to-end parses.

use std::collections::HashMap;

use monitor::eval::{truncate, Evaluator, GroupStyle};

use proptest::prelude::*;

fn eval(text: &str) -> u64 {
    let symbols: HashMap<String, u64> = HashMap::new();
    Evaluator::new(&symbols).parse(text).unwrap()
}

#[test]
fn grouped_arithmetic_and_masking() {
    assert_eq!(eval("{3+4}*2"), 14);
    assert_eq!(eval("0xff & 0xf0"), 0xF0);
    assert_eq!(eval("10."), 10);
}

#[test]
fn bracket_grouping_style() {
    let symbols: HashMap<String, u64> = HashMap::new();
    let eval = Evaluator::new(&symbols).with_group(GroupStyle::Bracket);
    assert_eq!(eval.parse("[1+2]*3").unwrap(), 9);
}

#[test]
fn nested_groups() {
    assert_eq!(eval("{{1+2}*{3+4}}+1"), 22);
}

#[test]
fn precedence_spans_all_levels() {
    // Shifts bind looser than addition, tighter than comparison.
    assert_eq!(eval("1 << 2 + 3"), 32);
    assert_eq!(eval("5 + 3 * 2 == B"), 1);
    assert_eq!(eval("1 | 2 ^! 3 & 2"), 1 | (2 ^ (3 & 2)));
}

proptest! {
    /// Formatting a value in a base and parsing it back is the identity,
    /// for every base the monitor prints in.
    #[test]
    fn round_trips_in_every_base(v in 0u64..0x1_0000_0000) {
        let symbols: HashMap<String, u64> = HashMap::new();

        let hex = Evaluator::new(&symbols).with_bits(32);
        prop_assert_eq!(hex.parse(&format!("{:X}", v)).unwrap(), v);

        let oct = Evaluator::new(&symbols).with_bits(32).with_base(8);
        prop_assert_eq!(oct.parse(&format!("{:o}", v)).unwrap(), v);

        let dec = Evaluator::new(&symbols).with_bits(32).with_base(10);
        prop_assert_eq!(dec.parse(&format!("{}", v)).unwrap(), v);

        let bin = Evaluator::new(&symbols).with_bits(32).with_base(2);
        prop_assert_eq!(bin.parse(&format!("{:b}", v)).unwrap(), v);
    }

    /// Unsigned truncation is plain modulo 2^n.
    #[test]
    fn truncation_is_modulo(x in any::<u64>(), n in 1u32..64) {
        let expected = x % (1u64 << n);
        prop_assert_eq!(truncate(x, n, true), expected);
    }

    /// Signed truncation sign-extends: reading the low n bits as a
    /// signed quantity and widening gives the same 64-bit pattern.
    #[test]
    fn signed_truncation_sign_extends(x in any::<u64>(), n in 1u32..64) {
        let t = truncate(x, n, false);
        let sign = 1u64 << (n - 1);
        if x & sign != 0 {
            prop_assert_eq!(t | ((1u64 << n) - 1), u64::MAX | t);
            prop_assert_eq!(truncate(t, n, true), x % (1u64 << n));
        } else {
            prop_assert_eq!(t, x % (1u64 << n));
        }
    }
}
