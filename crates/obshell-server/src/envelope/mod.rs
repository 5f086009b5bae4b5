// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request envelope.
//!
//! Layers, outermost first:
//!
//! 1. [`trace::request_envelope`]: trace id, timing, response rendering
//! 2. [`local::admit_local_peer`]: UID check on the administrative socket
//! 3. [`verify::verify`]: header, token, password or session
//! 4. [`body::decrypt_body`]: AES body decryption and masked logging
//! 5. [`forward::forward_to_maintainer`]: replay on the maintainer

pub mod body;
pub mod forward;
pub mod local;
pub mod mask;
pub mod trace;
pub mod verify;

pub use trace::RequestMeta;
pub use verify::{Caller, SESSION_HEADER};
