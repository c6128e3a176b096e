// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GSM 03.38 segment counting for SMS part estimation.

/// Characters of the GSM-7 default alphabet that take one septet.
const BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";

/// Characters reached through the escape table, taking two septets.
const EXTENDED: &str = "^{}\\[~]|€\u{000C}";

const SINGLE_SEGMENT_GSM7: usize = 160;
const MULTI_SEGMENT_GSM7: usize = 153;
const SINGLE_SEGMENT_UNICODE: usize = 70;
const MULTI_SEGMENT_UNICODE: usize = 67;

fn septets(c: char) -> Option<usize> {
    if BASIC.contains(c) {
        Some(1)
    } else if EXTENDED.contains(c) {
        Some(2)
    } else {
        None
    }
}

/// Whether the text can be sent with the GSM-7 alphabet.
pub fn is_valid(text: &str) -> bool {
    text.chars().all(|c| septets(c).is_some())
}

/// Number of SMS parts needed to send `text`.
///
/// Falls back to UCS-2 sizing when any character is outside the GSM-7 alphabet.
pub fn segments(text: &str) -> usize {
    let gsm_len: Option<usize> = text.chars().map(septets).sum();

    let (len, single, multi) = match gsm_len {
        Some(len) => (len, SINGLE_SEGMENT_GSM7, MULTI_SEGMENT_GSM7),
        None => (
            text.chars().count(),
            SINGLE_SEGMENT_UNICODE,
            MULTI_SEGMENT_UNICODE,
        ),
    };

    if len <= single {
        1
    } else {
        len.div_ceil(multi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gsm7_segments() {
        assert_eq!(segments(""), 1);
        assert_eq!(segments("hello world"), 1);
        assert_eq!(segments(&"a".repeat(160)), 1);
        assert_eq!(segments(&"a".repeat(161)), 2);
        assert_eq!(segments(&"a".repeat(306)), 2);
        assert_eq!(segments(&"a".repeat(307)), 3);
    }

    #[test]
    fn test_extended_chars_take_two_septets() {
        assert!(is_valid("{}€"));
        assert_eq!(segments(&"€".repeat(80)), 1);
        assert_eq!(segments(&"€".repeat(81)), 2);
    }

    #[test]
    fn test_unicode_segments() {
        assert!(!is_valid("ሰላም"));
        assert_eq!(segments(&"ሰ".repeat(70)), 1);
        assert_eq!(segments(&"ሰ".repeat(71)), 2);
        assert_eq!(segments(&"ሰ".repeat(134)), 2);
        assert_eq!(segments(&"ሰ".repeat(135)), 3);
    }
}
