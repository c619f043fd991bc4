// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT transport: the broker client and the topic router.

mod broker;
mod router;

pub use broker::{BrokerClient, BrokerEventLoop, BrokerStats, CONTROLLER_SUBSCRIPTIONS};
pub use router::{FrameHandler, IngressFrame, RouterStats, TopicRouter};
