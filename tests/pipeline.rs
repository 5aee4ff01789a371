use ppk_stream::bitfield::{encode, RawSample};
use ppk_stream::calibration::RANGE_COUNT;
use ppk_stream::{
    CalibrationTable, Decoder, DecoderConfig, DecoderEvent, SampleCollector, SpikeFilterUpdate,
};

/// Calibration that maps a scaled ADC count straight to amperes.
fn identity_table() -> CalibrationTable {
    let mut table = CalibrationTable::new().with_adc_scale(1.0);
    table.r = [1.0; RANGE_COUNT];
    table.gs = [0.0; RANGE_COUNT];
    table
}

fn word(range: u8, counter: u8, adc: u16, bits: u8) -> [u8; 4] {
    encode(RawSample {
        range,
        counter,
        raw_adc: adc,
        digital_bits: bits,
    })
    .to_le_bytes()
}

fn stream(words: &[[u8; 4]]) -> Vec<u8> {
    words.iter().flatten().copied().collect()
}

fn decoder() -> Decoder {
    Decoder::streaming(DecoderConfig::default(), identity_table())
}

fn currents(sink: &SampleCollector) -> Vec<Option<f64>> {
    sink.samples.iter().map(|s| s.current_ua).collect()
}

#[test]
fn byte_at_a_time_matches_single_chunk() {
    let words: Vec<[u8; 4]> = (0..200u16)
        .map(|i| word(1, (i % 64) as u8, i, (i % 256) as u8))
        .collect();
    let bytes = stream(&words);

    let mut whole = SampleCollector::default();
    decoder().feed(&bytes, &mut whole);

    let mut split = SampleCollector::default();
    let mut dec = decoder();
    for b in &bytes {
        dec.feed(std::slice::from_ref(b), &mut split);
    }

    assert_eq!(whole.samples.len(), 200);
    assert_eq!(whole.samples, split.samples);
    assert_eq!(split.samples[10].current_ua, Some(40.0 * 1e6));
    assert_eq!(split.samples[10].digital_bits, Some(10));
    assert_eq!(dec.stats().words_decoded, 200);
}

#[test]
fn counter_wraparound_is_continuous() {
    let words: Vec<[u8; 4]> = [60u8, 61, 62, 63, 0, 1, 2]
        .iter()
        .map(|&c| word(0, c, 1, 0))
        .collect();
    let mut sink = SampleCollector::default();
    let mut dec = decoder();
    dec.feed(&stream(&words), &mut sink);
    assert_eq!(sink.samples.len(), 7);
    assert_eq!(dec.loss_count(), 0);
    assert_eq!(dec.stats().placeholders_emitted, 0);
}

#[test]
fn reordered_words_come_out_in_counter_order() {
    let words: Vec<[u8; 4]> = [0u8, 2, 1, 3]
        .iter()
        .map(|&c| word(2, c, u16::from(c) + 1, c))
        .collect();
    let mut sink = SampleCollector::default();
    decoder().feed(&stream(&words), &mut sink);
    let bits: Vec<Option<u8>> = sink.samples.iter().map(|s| s.digital_bits).collect();
    assert_eq!(bits, vec![Some(0), Some(1), Some(2), Some(3)]);
}

#[test]
fn confirmed_loss_fills_timeline_with_placeholders() {
    let mut words = vec![word(0, 63, 1, 0)];
    // five stray counters park in the reorder window while expected runs 0..5
    words.extend((40..45u8).map(|c| word(0, c, 1, 0)));
    words.push(word(0, 10, 7, 0));
    let mut sink = SampleCollector::default();
    let mut dec = decoder();
    dec.feed(&stream(&words), &mut sink);

    // parked samples first, then one placeholder per missing slot
    assert_eq!(sink.samples.len(), 12);
    assert!(sink.samples[1..6].iter().all(|s| !s.is_placeholder()));
    assert!(sink.samples[6..11].iter().all(|s| s.is_placeholder()));
    assert_eq!(sink.samples[11].current_ua, Some(28.0 * 1e6));
    assert_eq!(dec.loss_count(), 5);
    assert_eq!(dec.stats().placeholders_emitted, 5);
}

#[test]
fn dropped_word_keeps_timeline_length() {
    let sent = [0u8, 2, 3, 4, 5, 6, 7, 8, 9];
    let words: Vec<[u8; 4]> = sent.iter().map(|&c| word(0, c, 1, c)).collect();
    let mut sink = SampleCollector::default();
    let mut dec = decoder();
    dec.feed(&stream(&words), &mut sink);

    assert_eq!(sink.samples.len(), 10);
    let bits: Vec<u8> = sink.samples.iter().filter_map(|s| s.digital_bits).collect();
    assert_eq!(bits, sent.to_vec());
    assert_eq!(dec.stats().placeholders_emitted, 1);
    assert_eq!(dec.loss_count(), 1);

    // the stream carries on in order afterwards
    dec.feed(&stream(&[word(0, 10, 1, 10)]), &mut sink);
    assert_eq!(sink.samples.len(), 11);
    assert_eq!(sink.samples[10].digital_bits, Some(10));
}

#[test]
fn reordering_across_counter_wrap() {
    let words: Vec<[u8; 4]> = [62u8, 0, 63, 1, 2]
        .iter()
        .map(|&c| word(0, c, 1, c))
        .collect();
    let mut sink = SampleCollector::default();
    let mut dec = decoder();
    dec.feed(&stream(&words), &mut sink);
    let bits: Vec<Option<u8>> = sink.samples.iter().map(|s| s.digital_bits).collect();
    assert_eq!(bits, vec![Some(62), Some(63), Some(0), Some(1), Some(2)]);
    assert_eq!(dec.loss_count(), 0);
}

#[test]
fn sentinel_line_break_in_separate_read() {
    let mut dec = Decoder::default();
    let mut sink = SampleCollector::default();
    dec.feed(b"R0: 1000\nVDD: 3300\nEND", &mut sink);
    let mut next = b"\n".to_vec();
    next.extend(stream(&[
        word(0, 0, 1, 0),
        word(0, 1, 1, 1),
        word(0, 2, 1, 2),
        word(0, 3, 1, 3),
    ]));
    dec.feed(&next, &mut sink);
    let bits: Vec<Option<u8>> = sink.samples.iter().map(|s| s.digital_bits).collect();
    assert_eq!(bits, vec![Some(0), Some(1), Some(2), Some(3)]);
}

#[test]
fn loss_diagnostic_is_edge_triggered() {
    let config = DecoderConfig {
        pending_capacity: 0,
        loss_threshold: 60,
        ..DecoderConfig::default()
    };
    let mut dec = Decoder::streaming(config, identity_table());
    let mut sink = SampleCollector::default();

    // every other word skips 31 slots
    let words: Vec<[u8; 4]> = [0u8, 32, 0, 32, 0, 32]
        .iter()
        .map(|&c| word(0, c, 1, 0))
        .collect();
    dec.feed(&stream(&words), &mut sink);
    let losses = |s: &SampleCollector| {
        s.events
            .iter()
            .filter(|e| matches!(e, DecoderEvent::DataLoss { .. }))
            .count()
    };
    assert_eq!(dec.loss_count(), 155);
    assert_eq!(losses(&sink), 1);

    dec.reset_sampling();
    assert_eq!(dec.loss_count(), 0);
    dec.feed(&stream(&words), &mut sink);
    assert_eq!(losses(&sink), 2);
}

#[test]
fn switch_into_highest_gain_range_has_no_spike() {
    let mut dec = decoder();
    let mut sink = SampleCollector::default();
    let mut counter = 0u8;
    let mut next = |range: u8, adc: u16| {
        let w = word(range, counter, adc, 0);
        counter = (counter + 1) % 64;
        w
    };
    let mut words: Vec<[u8; 4]> = (0..40).map(|_| next(1, 100)).collect();
    words.extend((0..4).map(|_| next(4, 4000)));
    dec.feed(&stream(&words), &mut sink);

    let before = 400.0 * 1e6;
    let values = currents(&sink);
    for v in &values[40..42] {
        let v = v.expect("real sample");
        assert!((v - before).abs() < 1e-3, "spike after range switch: {v}");
    }
    // third guarded sample moves one slow-average step towards the new level
    let third = values[42].expect("real sample");
    assert!((third - (0.06 * 16000.0e6 + 0.94 * before)).abs() < 1.0);
    assert_eq!(values[43], Some(16000.0 * 1e6));
}

#[test]
fn user_gain_applies_to_next_sample() {
    let mut dec = decoder();
    let mut sink = SampleCollector::default();
    dec.feed(&word(3, 0, 10, 0), &mut sink);
    dec.set_user_gain(3, 2.0).unwrap();
    dec.feed(&word(3, 1, 10, 0), &mut sink);
    assert_eq!(currents(&sink), vec![Some(40.0e6), Some(80.0e6)]);
    assert!(dec.set_user_gain(RANGE_COUNT, 1.0).is_err());
}

#[test]
fn spike_filter_can_be_retuned() {
    let mut dec = decoder();
    dec.set_spike_filter(SpikeFilterUpdate {
        samples: Some(0),
        ..Default::default()
    });
    let mut sink = SampleCollector::default();
    let words = [word(0, 0, 1, 0), word(1, 1, 100, 0), word(1, 2, 100, 0)];
    dec.feed(&stream(&words), &mut sink);
    // a zero-length guard only smooths the switching sample itself
    assert_eq!(sink.samples[2].current_ua, Some(400.0e6));
}

#[test]
fn metadata_then_samples_in_one_read() {
    let mut dec = Decoder::default();
    let mut sink = SampleCollector::default();
    let mut bytes = b"Calibrated: 1\nR0: 500\nUG0: nan\nVDD: 1800\nEND\n".to_vec();
    bytes.extend(stream(&[word(0, 5, 100, 1), word(0, 6, 100, 2)]));
    // split inside the first binary word
    let cut = bytes.len() - 6;
    dec.feed(&bytes[..cut], &mut sink);
    dec.feed(&bytes[cut..], &mut sink);

    assert!(dec.is_streaming());
    assert_eq!(dec.vdd_mv(), 1800);
    assert_eq!(dec.calibration().r[0], 500.0);
    assert_eq!(dec.calibration().ug[0], 1.0);
    assert_eq!(sink.samples.len(), 2);
    let meta = dec.metadata().expect("metadata kept");
    assert_eq!(meta.calibrated(), Some(true));
}
