//! Pure routing of rumqttc events into transport-level packets
//!
//! The event loop task calls [`MessageHandler::route_mqtt_event`] for every
//! event it polls and acts on the returned [`EventRoute`].

use crate::transport::InboundPacket;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to the appropriate handling (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => {
                    if connack.code == ConnectReturnCode::Success {
                        EventRoute::Inbound(InboundPacket::ConnAck {
                            session_present: connack.session_present,
                        })
                    } else {
                        EventRoute::Refused(format!("{:?}", connack.code))
                    }
                }
                Packet::Publish(publish) => EventRoute::Inbound(InboundPacket::Publish {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                }),
                Packet::PubAck(puback) => EventRoute::Inbound(InboundPacket::PubAck {
                    packet_id: puback.pkid,
                }),
                Packet::SubAck(suback) => EventRoute::Inbound(InboundPacket::SubAck {
                    packet_id: suback.pkid,
                    return_codes: Self::subscribe_return_codes(&suback.return_codes),
                }),
                Packet::Disconnect => EventRoute::BrokerDisconnected,
                other => EventRoute::Inbound(InboundPacket::Other(format!("{other:?}"))),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::LocalDisconnect,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Map SubAck reason codes to MQTT 3.1.1 return code bytes (pure function)
    pub fn subscribe_return_codes(codes: &[SubscribeReasonCode]) -> Vec<u8> {
        codes
            .iter()
            .map(|code| match code {
                SubscribeReasonCode::Success(qos) => *qos as u8,
                SubscribeReasonCode::Failure => 0x80,
            })
            .collect()
    }

    /// Validate subscription success from SubAck return codes (pure function)
    pub fn validate_subscription_success(return_codes: &[u8]) -> Result<(), String> {
        if return_codes.iter().any(|&code| code >= 0x80) {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Packet to hand to the delegate
    Inbound(InboundPacket),
    /// Broker answered the connect with a failure code
    Refused(String),
    /// Broker closed the session
    BrokerDisconnected,
    /// Our DISCONNECT went out; the session is over
    LocalDisconnect,
    /// Other outgoing traffic (handled by rumqttc)
    OutgoingEvent,
}
