//! Human-readable rendering of device events, broadcasts and decoded packets.

use console::style;
use lidarlink_core::{
    BroadcastBody, BroadcastInfo, CommandSet, DeviceEvent, DeviceInfo, DeviceStatus,
    FrameError, GeneralCommand, HandshakeAck, HandshakeRequest, HeartbeatResponse, HubCommand,
    HubQueryLidarInformationResponse, Packet, PacketType, PayloadError,
};

/// One line per broadcast
#[must_use]
pub fn format_broadcast(info: &BroadcastInfo) -> String {
    format!(
        "{} {:<16} {:<8} {}",
        style("broadcast").cyan(),
        info.broadcast_code,
        info.device_type,
        info.ip
    )
}

/// One line per device notification
#[must_use]
pub fn format_event(info: &DeviceInfo, event: DeviceEvent) -> String {
    let tag = match event {
        DeviceEvent::Connect | DeviceEvent::HubConnectionChange => style(event).green(),
        DeviceEvent::Disconnect => style(event).red(),
        DeviceEvent::StateChange => style(event).yellow(),
    };

    let mut line = format!(
        "{tag} handle={} code={} type={} ip={}",
        info.handle, info.broadcast_code, info.device_type, info.ip
    );
    if info.slot != 0 {
        line.push_str(&format!(" slot={} id={}", info.slot, info.id));
    }
    if event == DeviceEvent::StateChange {
        line.push_str(&format!(
            " state={:?} feature={:?} status={}",
            info.state,
            info.feature,
            format_status(&info.status)
        ));
    }
    line
}

/// Status word, as progress or hex code
#[must_use]
pub fn format_status(status: &DeviceStatus) -> String {
    match status {
        DeviceStatus::Progress(progress) => format!("{progress}%"),
        DeviceStatus::Code(code) => format!("0x{:08X}", code.0),
    }
}

/// Describe a raw packet: header fields, then the typed body when the
/// command is one the connection layer understands.
///
/// # Errors
///
/// Returns the framing error if the bytes are not a valid packet.
pub fn describe_packet(bytes: &[u8]) -> Result<Vec<String>, FrameError> {
    let packet = Packet::decode(bytes)?;

    let mut lines = vec![
        format!("version:     {}", packet.version()),
        format!("length:      {}", packet.len()),
        format!("type:        {:?}", packet.packet_type()),
        format!("sequence:    {}", packet.sequence()),
        format!(
            "command:     {:?}/{}",
            packet.command_set(),
            command_name(packet.command_set(), packet.command_id())
        ),
        format!("payload:     {}", hex::encode(packet.payload())),
    ];

    match describe_body(&packet) {
        Some(Ok(body)) => lines.extend(body),
        Some(Err(e)) => lines.push(format!("body error:  {e}")),
        None => {}
    }
    Ok(lines)
}

fn command_name(set: CommandSet, id: u8) -> String {
    match set {
        CommandSet::General => match GeneralCommand::try_from(id) {
            Ok(cmd) => format!("{cmd:?}"),
            Err(id) => format!("0x{id:02X}"),
        },
        CommandSet::Hub if id == HubCommand::QueryLidarInformation as u8 => {
            format!("{:?}", HubCommand::QueryLidarInformation)
        }
        _ => format!("0x{id:02X}"),
    }
}

fn describe_body(packet: &Packet<'_>) -> Option<Result<Vec<String>, PayloadError>> {
    let payload = packet.payload();
    let general = |cmd: GeneralCommand| packet.is_command(CommandSet::General, cmd as u8);

    if general(GeneralCommand::Broadcast) {
        return Some(BroadcastBody::decode(payload).map(|body| {
            vec![
                format!("broadcast:   {}", body.broadcast_code),
                format!("device:      {}", body.device_type),
            ]
        }));
    }

    if general(GeneralCommand::Handshake) {
        // Host requests carry the port triple; device replies carry a return code
        if payload.len() >= HandshakeRequest::SIZE {
            return Some(HandshakeRequest::decode(payload).map(|req| {
                vec![
                    format!("host ip:     {}", req.ip),
                    format!(
                        "ports:       cmd={} data={} sensor={}",
                        req.cmd_port, req.data_port, req.sensor_port
                    ),
                ]
            }));
        }
        return Some(HandshakeAck::decode(payload).map(|ack| {
            vec![format!("ret code:    {}", ack.ret_code)]
        }));
    }

    if general(GeneralCommand::Heartbeat) && packet.packet_type() == PacketType::Ack {
        return Some(HeartbeatResponse::decode(payload).map(|hb| {
            vec![
                format!("ret code:    {}", hb.ret_code),
                format!("state:       {:?}", hb.state),
                format!("feature:     {:?}", hb.feature),
                format!("status:      {}", format_status(&hb.status)),
            ]
        }));
    }

    if packet.is_command(CommandSet::Hub, HubCommand::QueryLidarInformation as u8)
        && packet.packet_type() == PacketType::Ack
    {
        return Some(HubQueryLidarInformationResponse::decode(payload).map(|resp| {
            let mut lines = vec![
                format!("ret code:    {}", resp.ret_code),
                format!("lidars:      {}", resp.lidars.len()),
            ];
            for lidar in &resp.lidars {
                lines.push(format!(
                    "  slot={} id={} code={} type={}",
                    lidar.slot, lidar.id, lidar.broadcast_code, lidar.device_type
                ));
            }
            lines
        }));
    }

    None
}
