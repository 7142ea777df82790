//! Fixed signatures of the RTOS, hardware and debug intrinsics.

use crate::lexer::Intrinsic;

use super::types::Type;

/// Signature of a built-in function.
#[derive(Debug, Clone)]
pub struct BuiltinSignature {
    pub params: Vec<Type>,
    pub return_type: Type,
    /// `printf` takes any number of value arguments after the format.
    pub variadic: bool,
}

/// Signature of an intrinsic call.
pub fn signature(intrinsic: Intrinsic) -> BuiltinSignature {
    use Intrinsic::*;
    use Type::*;

    let (params, return_type, variadic) = match intrinsic {
        RtosCreateTask => (
            vec![Void.pointer_to(), Str, Int, Int, Int],
            Void,
            false,
        ),
        RtosDeleteTask => (vec![Int], Void, false),
        RtosDelayMs => (vec![Int], Void, false),
        RtosSemaphoreCreate => (vec![], Int, false),
        RtosSemaphoreTake => (vec![Int, Int], Int, false),
        RtosSemaphoreGive => (vec![Int], Void, false),
        RtosYield => (vec![], Void, false),
        RtosSuspendTask => (vec![Int], Void, false),
        RtosResumeTask => (vec![Int], Void, false),

        HwGpioInit => (vec![Int, Int], Void, false),
        HwGpioSet => (vec![Int, Int], Void, false),
        HwGpioGet => (vec![Int], Int, false),
        HwTimerInit => (vec![Int, Int, Int], Void, false),
        HwTimerStart => (vec![Int], Void, false),
        HwTimerStop => (vec![Int], Void, false),
        HwTimerSetPwmDuty => (vec![Int, Int], Void, false),
        HwAdcInit => (vec![Int], Void, false),
        HwAdcRead => (vec![Int], Int, false),
        HwUartWrite => (vec![Char.pointer_to(), Int], Void, false),
        HwSpiTransfer => (vec![Char.pointer_to(), Char.pointer_to(), Int], Void, false),
        HwI2cWrite => (vec![Int, Int], Void, false),
        HwI2cRead => (vec![Int, Int], Int, false),

        DbgPrint | Print => (vec![Str], Void, false),
        Printf => (vec![Str], Void, true),
        DbgBreakpoint => (vec![], Void, false),

        StartTask => (vec![Int, Int, Int, Int, Void.pointer_to()], Void, false),
    };

    BuiltinSignature {
        params,
        return_type,
        variadic,
    }
}

/// Look an intrinsic up by its reserved word.
pub fn by_name(name: &str) -> Option<Intrinsic> {
    use Intrinsic::*;
    [
        RtosCreateTask,
        RtosDeleteTask,
        RtosDelayMs,
        RtosSemaphoreCreate,
        RtosSemaphoreTake,
        RtosSemaphoreGive,
        RtosYield,
        RtosSuspendTask,
        RtosResumeTask,
        HwGpioInit,
        HwGpioSet,
        HwGpioGet,
        HwTimerInit,
        HwTimerStart,
        HwTimerStop,
        HwTimerSetPwmDuty,
        HwAdcInit,
        HwAdcRead,
        HwUartWrite,
        HwSpiTransfer,
        HwI2cWrite,
        HwI2cRead,
        DbgPrint,
        DbgBreakpoint,
        Print,
        Printf,
        StartTask,
    ]
    .into_iter()
    .find(|i| i.name() == name)
}
