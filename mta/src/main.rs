//! `sendmail` multi-call binary entry point (spec §6). Dispatches on
//! `argv[0]`'s basename (`mailq`, `newaliases`) and on the flags in
//! [`mta::Opt`] to one of: submit a message, list the queue, reload the
//! alias table, nudge the Queue Manager, or run one SMTP session on stdio.

use std::process::ExitCode;

use structopt::StructOpt;
use tracing::error;

use mta::{
    bs, call_as, newaliases, normalize_argv, queue_dir_from_env, queue_flush, submit,
    trigger_path_from_env, CallAs, Opt, EX_OK, EX_USAGE,
};
use mta_queue::QueueRoot;
use mta_trigger::Endpoint;

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let argv0 = std::env::args().next().unwrap_or_default();
    let args = normalize_argv(std::env::args());
    let opt = Opt::from_iter(args);

    let code = match run(&argv0, &opt) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "sendmail invocation failed");
            eprintln!("sendmail: {}", e);
            mta::EX_SOFTWARE
        }
    };
    ExitCode::from(code as u8)
}

fn run(argv0: &str, opt: &Opt) -> anyhow::Result<i32> {
    let queue_dir = opt.queue_dir.clone().unwrap_or_else(queue_dir_from_env);
    let queue = QueueRoot::new(queue_dir.clone(), true)?;
    let trigger_path = trigger_path_from_env(&queue_dir);
    // Best-effort: the Queue Manager may not have created its endpoint yet
    // (or may be configured to use a fifo instead of a socket), in which
    // case every wakeup this invocation sends is silently dropped -- the
    // periodic scan timer is the fallback (spec §4.2).
    let trigger = if mta_trigger::is_fifo(&trigger_path) {
        Endpoint::create_fifo(trigger_path.clone()).ok()
    } else {
        Some(Endpoint::socket(trigger_path.clone()))
    };

    if opt.mailq || matches!(call_as(argv0), CallAs::MailQ) {
        return mta::mailq(&queue);
    }

    if opt.newaliases || matches!(call_as(argv0), CallAs::NewAliases) {
        let Some(path) = &opt.aliases else {
            eprintln!("newaliases: no alias table configured (pass --aliases)");
            return Ok(EX_USAGE);
        };
        return newaliases(path);
    }

    if opt.stdin_smtp {
        let hostname = hostname_or_default();
        bs::run(&queue, trigger.as_ref(), hostname)?;
        return Ok(EX_OK);
    }

    if opt.queue_flush {
        let Some(trigger) = &trigger else {
            eprintln!("sendmail: no trigger endpoint available to request a flush");
            return Ok(mta::EX_UNAVAILABLE);
        };
        return Ok(queue_flush(trigger, None));
    }

    if let Some(site) = &opt.flush_site {
        let Some(trigger) = &trigger else {
            eprintln!("sendmail: no trigger endpoint available to request a flush");
            return Ok(mta::EX_UNAVAILABLE);
        };
        return Ok(queue_flush(trigger, Some(site)));
    }

    submit(opt, &queue, trigger.as_ref())
}

fn hostname_or_default() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}
