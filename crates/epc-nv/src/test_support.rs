//! Shared fixtures for the unit tests

use std::collections::BTreeMap;
use std::sync::Arc;

use epc_bus::MockBus;
use epc_conv::{pack_frame, unpack, CanMatrix, Frame, Signal, SubFrame};
use parking_lot::Mutex;

use crate::config::{DeviceConfig, ProtocolVariant};
use crate::protocol::{NvProtocol, ProtocolFrames};
use crate::registry::Registry;

/// Device memory keyed by `(signal, meta tag)`
pub(crate) type DeviceStore = Arc<Mutex<BTreeMap<(String, i64), i64>>>;

pub(crate) fn nv_frame(name: &str, id: u32, flag: &str) -> Frame {
    Frame::new(name, id, true)
        .with_multiplexer(Signal::new("MUX", 0, 8))
        .with_signal(Signal::new(flag, 8, 1))
        .with_signal(Signal::new("Meta", 9, 3))
        .with_sub_frame(SubFrame::new(
            3,
            "Frequency",
            vec![
                Signal::new("FrequencyReference", 16, 16).with_scaling("0.1", "0"),
                Signal::new("FrequencyLimit", 32, 16),
            ],
        ))
        .with_sub_frame(SubFrame::new(
            4,
            "Access",
            vec![
                Signal::new("AccessLevel", 16, 8),
                Signal::new("AccessPassword", 24, 32).with_comment("<secret> <write-only>"),
            ],
        ))
}

pub(crate) fn matrix() -> CanMatrix {
    CanMatrix::from_frames(
        Default::default(),
        vec![
            nv_frame("ParameterQuery", 0x1FF00, "ReadParam_command"),
            nv_frame("ParameterResponse", 0x1FF01, "ReadParam_status"),
        ],
    )
    .unwrap()
}

/// Echoing device for the frames of [`matrix`]
pub(crate) fn attach_device(bus: &MockBus) -> DeviceStore {
    attach_device_with(
        bus,
        nv_frame("ParameterQuery", 0x1FF00, "ReadParam_command"),
        nv_frame("ParameterResponse", 0x1FF01, "ReadParam_status"),
    )
}

/// Answer every request from the returned store, storing written values first
pub(crate) fn attach_device_with(bus: &MockBus, set: Frame, status: Frame) -> DeviceStore {
    let store: DeviceStore = Arc::default();
    let memory = store.clone();
    bus.set_responder(move |frame| {
        let Ok(mut values) = unpack(&set, &frame.data) else {
            return vec![];
        };
        let read = values.remove("ReadParam_command").unwrap_or(1);
        let meta = values["Meta"];
        let mut memory = memory.lock();
        for (name, raw) in values.iter_mut() {
            if name == "MUX" || name == "Meta" {
                continue;
            }
            let key = (name.clone(), meta);
            if read == 0 {
                memory.insert(key, *raw);
            } else {
                *raw = memory.get(&key).copied().unwrap_or(0);
            }
        }
        values.insert("ReadParam_status".to_string(), read);
        vec![pack_frame(&status, &values).unwrap()]
    });
    store
}

pub(crate) fn protocol(bus: Arc<MockBus>, config: &DeviceConfig) -> NvProtocol {
    let matrix = matrix();
    let registry = Registry::from_matrix(&matrix, config).unwrap().into_shared();
    let frames = ProtocolFrames::from_matrix(&matrix, ProtocolVariant::Extended).unwrap();
    NvProtocol::new(bus, registry, frames, config)
}
