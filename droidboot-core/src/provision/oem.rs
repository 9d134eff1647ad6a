//! `oem <command> [args]` handling.

use log::{error, info};
use winnow::ModalResult;
use winnow::ascii::space0;
use winnow::combinator::preceded;
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::{rest, take_till};

use super::{Provisioner, TarballOrigin, logged_run};
use crate::fastboot::CommandContext;
use crate::partition::BootDevice;
use crate::platform::Platform;

const PROXY_PROPERTY: &str = "service.proxy.enable";

fn oem_line<'a>(input: &mut &'a str) -> ModalResult<(&'a str, &'a str), ContextError> {
    (
        preceded(space0, take_till(1.., ' ')),
        preceded(space0, rest),
    )
        .parse_next(input)
}

pub(super) fn handle_oem<P: Platform>(argument: &str, ctx: &mut CommandContext<'_, Provisioner<P>>) {
    let Ok((command, args)) = oem_line.parse(argument) else {
        ctx.fail("unknown OEM command");
        return;
    };
    let args = args.trim_end();
    info!("oem {command} {args}");

    match command {
        "system" => match logged_run(ctx, args) {
            Ok(0) => ctx.okay(""),
            status => {
                error!("oem system {args}: {status:?}");
                ctx.fail("OEM system command failed");
            }
        },
        "tarball_origin" => match TarballOrigin::from_name(args) {
            Some(origin) => {
                ctx.pipeline.origin = origin;
                ctx.variables.publish("tarball_origin", origin.as_str());
                ctx.okay("");
            }
            None => ctx.fail("unknown tarball_origin directory"),
        },
        "log_enable" => {
            ctx.pipeline.log_enable = true;
            ctx.okay("");
        }
        "log_disable" => {
            ctx.pipeline.log_enable = false;
            ctx.okay("");
        }
        "bootdev" => set_boot_device(args, ctx),
        "proxy" => set_proxy(args, ctx),
        _ => ctx.fail("unknown OEM command"),
    }
}

fn set_boot_device<P: Platform>(name: &str, ctx: &mut CommandContext<'_, Provisioner<P>>) {
    let Some(device) = BootDevice::from_name(name) else {
        ctx.fail("unknown boot device");
        return;
    };
    ctx.pipeline.table.set_boot_device(device);
    ctx.variables.publish("bootdev", device.as_str());
    if device == BootDevice::Nfs && ctx.pipeline.enable_rndis().is_err() {
        ctx.fail("failed to enable rndis!");
        return;
    }
    ctx.okay("");
}

fn set_proxy<P: Platform>(mode: &str, ctx: &mut CommandContext<'_, Provisioner<P>>) {
    let pipeline = &mut *ctx.pipeline;
    let result = match mode {
        "start" if pipeline.platform.exists(&pipeline.config.hsi_node) => {
            pipeline.platform.set_property(PROXY_PROPERTY, "1")
        }
        "start" => {
            error!("modem link {} not present", pipeline.config.hsi_node);
            ctx.fail("OEM system command failed");
            return;
        }
        "stop" => pipeline.platform.set_property(PROXY_PROPERTY, "0"),
        _ => {
            ctx.fail("unknown OEM command");
            return;
        }
    };
    match result {
        Ok(()) => ctx.okay(""),
        Err(err) => {
            error!("proxy {mode}: {err}");
            ctx.fail("OEM system command failed");
        }
    }
}
