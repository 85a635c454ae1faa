/*!

# Relay Wire Protocol

## Introduction

The relay multiplexes many clients over a single full-duplex websocket per
client. Frames are JSON documents of the shape:

```json
{"type": "<frame type>", "data": { ... }}
```

The frame type doubles as the event name the session republishes the payload
under, so consumers subscribe to inbound traffic by type.

## Outbound frames

### register

```json
{"type": "register", "data": {"address": "<identity>"}}
```

Announces the client's identity. The relay acknowledges with a `registered`
frame carrying the same address; registration is complete when that frame
arrives.

### message

```json
{"type": "message", "data": {"from": "...", "to": "...", "text": "..."}}
```

Acknowledged by `messageSent` (matched on `data.to`) or failed by
`messageError` (`data.error` carries the reason).

### ping

```json
{"type": "ping", "timestamp": 1700000000000}
```

Fire-and-forget keepalive. No reply is awaited.

## Inbound frames

### message

```json
{"type": "message", "data": {"from": "...", "to": "...", "text": "...", "timestamp": 1700000000}}
```

A text routed to this client. The wire timestamp is seconds-since-epoch and
is converted to milliseconds before it reaches the store.

Unknown frame types are republished verbatim under their type so future
relay features need no client changes. Malformed frames are dropped and
logged, never fatal.

*/

pub mod correlator;
pub mod session;
pub mod wire;
