#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_arti_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_arti_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod direct;
mod err;
mod friends;
mod onion_router;
mod peers;
mod route_ctrl;
mod router;
mod self_onion;
mod transport;

pub use direct::{DirectTransport, PeerChannel, PeerChannels};
pub use err::TransportError;
pub use friends::{FriendControl, FriendTarget, PendingState};
pub use onion_router::{OnionRouterConfig, OnionRouterTransport};
pub use peers::{PeerDirectory, PeerHints};
pub use route_ctrl::{RouteContext, RouteController, RouteDecision};
pub use router::{InboundDelivery, RouteDriver, Router, RouterError, SendRequest};
pub use self_onion::{
    HopCircuit, HopCircuitBuilder, HopError, RelayDirectory, RelayId, SelfOnionConfig,
    SelfOnionTransport,
};
pub use transport::{
    InboundEvent, Packet, StateEvents, Transport, TransportKind, TransportPhase, TransportState,
};
