//! Packing and unpacking of frame payloads

use std::collections::BTreeMap;

use crate::error::{CodecError, CodecResult};
use crate::frame::Frame;
use crate::types::CanFrame;

/// Raw signal values keyed by signal name
pub type SignalValues = BTreeMap<String, i64>;

/// Pack named raw values into a payload of `frame.length` bytes
///
/// For multiplexed frames the layout is selected by the multiplexor value in
/// `values`. Signals of the layout that are absent from `values` are packed
/// as zero. The multiplexor is written last so it always wins the bits it
/// shares with other signals.
pub fn pack(frame: &Frame, values: &SignalValues) -> CodecResult<Vec<u8>> {
    let mux = match &frame.multiplexer {
        Some(name) => {
            let raw = values
                .get(name)
                .copied()
                .ok_or_else(|| CodecError::MissingMultiplexor(frame.name.clone()))?;
            let mux = u64::try_from(raw).map_err(|_| CodecError::UnknownMultiplex {
                frame: frame.name.clone(),
                value: raw as u64,
            })?;
            Some(mux)
        }
        None => None,
    };

    let layout = frame.layout(mux)?;
    for name in values.keys() {
        if !layout.iter().any(|s| &s.name == name) {
            return Err(CodecError::UnknownSignal {
                frame: frame.name.clone(),
                signal: name.clone(),
            });
        }
    }

    let mut payload = vec![0u8; frame.length as usize];
    let is_mux = |name: &str| frame.multiplexer.as_deref() == Some(name);

    for signal in layout.iter().filter(|s| !is_mux(&s.name)) {
        let raw = values.get(&signal.name).copied().unwrap_or(0);
        signal.insert(raw, &mut payload)?;
    }
    if let (Some(signal), Some(mux)) = (frame.multiplexer_signal(), mux) {
        signal.insert(mux as i64, &mut payload)?;
    }

    Ok(payload)
}

/// Pack into a ready-to-send CAN frame
pub fn pack_frame(frame: &Frame, values: &SignalValues) -> CodecResult<CanFrame> {
    Ok(CanFrame::new(frame.id, frame.extended, pack(frame, values)?))
}

/// Read the multiplexor value from a payload
///
/// Returns `Ok(None)` for frames that are not multiplexed.
pub fn multiplex_select(frame: &Frame, payload: &[u8]) -> CodecResult<Option<u64>> {
    let Some(signal) = frame.multiplexer_signal() else {
        return Ok(None);
    };
    let raw = signal
        .extract(payload)
        .ok_or_else(|| CodecError::PayloadTooShort {
            expected: signal.required_bytes(),
            actual: payload.len(),
        })?;
    Ok(Some(raw as u64))
}

/// Unpack every signal of the selected layout
///
/// Signals whose bits lie beyond a short payload are omitted from the
/// result. An undefined multiplexor value yields `UnknownMultiplex`.
pub fn unpack(frame: &Frame, payload: &[u8]) -> CodecResult<SignalValues> {
    let mux = multiplex_select(frame, payload)?;
    let layout = frame.layout(mux)?;

    let mut values = SignalValues::new();
    for signal in layout {
        match signal.extract(payload) {
            Some(raw) => {
                values.insert(signal.name.clone(), raw);
            }
            None => {
                tracing::trace!(
                    frame = %frame.name,
                    signal = %signal.name,
                    len = payload.len(),
                    "Signal beyond payload, skipped"
                );
            }
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SubFrame;
    use crate::signal::Signal;
    use pretty_assertions::assert_eq;

    fn query_frame() -> Frame {
        Frame::new("ParameterQuery", 0x1FF00, true)
            .with_multiplexer(Signal::new("MUX", 0, 8))
            .with_signal(Signal::new("ReadParam_command", 8, 1))
            .with_sub_frame(SubFrame::new(
                3,
                "Frequency",
                vec![Signal::new("FrequencyReference", 16, 16).with_scaling("0.1", "0")],
            ))
            .with_sub_frame(SubFrame::new(
                4,
                "Limits",
                vec![
                    Signal::new("LowLimit", 16, 12).signed(),
                    Signal::new("Mode", 31, 4).big_endian(),
                ],
            ))
    }

    fn values(pairs: &[(&str, i64)]) -> SignalValues {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_pack_multiplexed() {
        let frame = query_frame();
        let payload = pack(
            &frame,
            &values(&[
                ("MUX", 3),
                ("ReadParam_command", 1),
                ("FrequencyReference", 600),
            ]),
        )
        .unwrap();
        assert_eq!(payload, vec![0x03, 0x01, 0x58, 0x02, 0, 0, 0, 0]);
    }

    #[test]
    fn test_unpack_selects_layout() {
        let frame = query_frame();
        let unpacked = unpack(&frame, &[0x03, 0x01, 0x58, 0x02, 0, 0, 0, 0]).unwrap();
        assert_eq!(
            unpacked,
            values(&[
                ("FrequencyReference", 600),
                ("MUX", 3),
                ("ReadParam_command", 1),
            ])
        );
    }

    #[test]
    fn test_round_trip_mixed_layout() {
        let frame = query_frame();
        let input = values(&[("MUX", 4), ("ReadParam_command", 0), ("LowLimit", -100), ("Mode", 9)]);
        let payload = pack(&frame, &input).unwrap();
        assert_eq!(unpack(&frame, &payload).unwrap(), input);
    }

    #[test]
    fn test_absent_signals_pack_as_zero() {
        let frame = query_frame();
        let payload = pack(&frame, &values(&[("MUX", 3)])).unwrap();
        assert_eq!(payload, vec![0x03, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_missing_multiplexor() {
        let frame = query_frame();
        assert!(matches!(
            pack(&frame, &values(&[("FrequencyReference", 1)])),
            Err(CodecError::MissingMultiplexor(_))
        ));
    }

    #[test]
    fn test_unknown_multiplex() {
        let frame = query_frame();
        assert!(matches!(
            pack(&frame, &values(&[("MUX", 7)])),
            Err(CodecError::UnknownMultiplex { value: 7, .. })
        ));
        assert!(matches!(
            unpack(&frame, &[0x07, 0, 0, 0, 0, 0, 0, 0]),
            Err(CodecError::UnknownMultiplex { value: 7, .. })
        ));
    }

    #[test]
    fn test_signal_from_other_sub_frame_rejected() {
        let frame = query_frame();
        assert!(matches!(
            pack(&frame, &values(&[("MUX", 3), ("LowLimit", 1)])),
            Err(CodecError::UnknownSignal { .. })
        ));
    }

    #[test]
    fn test_width_overflow_on_pack() {
        let frame = query_frame();
        assert!(matches!(
            pack(&frame, &values(&[("MUX", 3), ("FrequencyReference", 70_000)])),
            Err(CodecError::WidthOverflow { .. })
        ));
    }

    #[test]
    fn test_short_payload_omits_signals() {
        let frame = query_frame();
        let unpacked = unpack(&frame, &[0x03, 0x01]).unwrap();
        assert_eq!(unpacked, values(&[("MUX", 3), ("ReadParam_command", 1)]));
    }

    #[test]
    fn test_plain_frame() {
        let frame = Frame::new("Heartbeat", 0x700, false).with_signal(Signal::new("state", 0, 8));
        assert_eq!(multiplex_select(&frame, &[5]).unwrap(), None);
        let can = pack_frame(&frame, &values(&[("state", 5)])).unwrap();
        assert_eq!(can.id, 0x700);
        assert!(!can.extended);
        assert_eq!(unpack(&frame, &can.data).unwrap(), values(&[("state", 5)]));
    }
}
