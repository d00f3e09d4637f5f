//! libwayland signature strings from wayland-rs message metadata

use wayland_backend::protocol::{AllowNull, ArgumentType, MessageDesc};

/// Rebuild the libwayland signature of a message
///
/// The "since" version is prefixed when above 1 and nullable arguments get a
/// `?` marker, so `wl_surface.offset` becomes `"5ii"`.
pub fn signature_of(desc: &MessageDesc) -> String {
    let mut signature = String::new();
    if desc.since > 1 {
        signature.push_str(&desc.since.to_string());
    }
    for arg in desc.signature {
        let (nullable, tag) = match arg {
            ArgumentType::Int => (false, 'i'),
            ArgumentType::Uint => (false, 'u'),
            ArgumentType::Fixed => (false, 'f'),
            ArgumentType::Str(allow) => (*allow == AllowNull::Yes, 's'),
            ArgumentType::Object(allow) => (*allow == AllowNull::Yes, 'o'),
            ArgumentType::NewId => (false, 'n'),
            ArgumentType::Array => (false, 'a'),
            ArgumentType::Fd => (false, 'h'),
        };
        if nullable {
            signature.push('?');
        }
        signature.push(tag);
    }
    signature
}

/// Static interface name of each argument, known only for typed new_ids
pub fn new_id_types(desc: &MessageDesc) -> Vec<Option<&'static str>> {
    desc.signature
        .iter()
        .map(|arg| match arg {
            ArgumentType::NewId => desc.child_interface.map(|interface| interface.name),
            _ => None,
        })
        .collect()
}
