use common::protocol::{
    ARG_DEPLOY_EPOCH, ARG_DEPLOY_ID, ARG_INTERACTIVE_MODE, ARG_REPORT_SERVICE_ADDRESS,
    ARG_REST_API_PORT, CONTROL_OPTIONS, CONTROL_SWITCHES,
};

/// Quita de los args del usuario cualquier flag de control (y el valor que
/// lo sigue), también en la forma `--flag=valor`.
pub fn anti_inject(user_args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(user_args.len());
    let mut it = user_args.iter();

    while let Some(raw) = it.next() {
        let arg = raw.trim();
        let flag = arg.split_once('=').map(|(f, _)| f).unwrap_or(arg);

        if CONTROL_SWITCHES.contains(&flag) {
            continue;
        }
        if CONTROL_OPTIONS.contains(&flag) {
            // `--flag valor`: también se descarta el valor
            if !arg.contains('=') {
                it.next();
            }
            continue;
        }
        out.push(arg.to_string());
    }
    out
}

/// Args de control que fijan la identidad del backend.
pub fn control_args(deploy_id: &str, epoch: u64, report_address: &str, port: u16) -> Vec<String> {
    vec![
        ARG_INTERACTIVE_MODE.to_string(),
        ARG_DEPLOY_ID.to_string(),
        deploy_id.to_string(),
        ARG_DEPLOY_EPOCH.to_string(),
        epoch.to_string(),
        ARG_REPORT_SERVICE_ADDRESS.to_string(),
        report_address.to_string(),
        ARG_REST_API_PORT.to_string(),
        port.to_string(),
    ]
}

/// Args finales del proceso: los del usuario ya saneados y luego los de control.
pub fn assemble(
    user_args: &[String],
    deploy_id: &str,
    epoch: u64,
    report_address: &str,
    port: u16,
) -> Vec<String> {
    let mut args = anti_inject(user_args);
    args.extend(control_args(deploy_id, epoch, report_address, port));
    args
}
